//! Integration tests for regulator acceptance testing.

mod budget_test;
mod common;
mod exclusion_test;
mod gpu_test;
mod lifecycle_test;
