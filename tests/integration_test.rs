mod common;
mod membership;
