mod join_test;
mod leave_test;
