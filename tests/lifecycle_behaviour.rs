//! Behavioural tests for the instance lifecycle.

mod lifecycle;
