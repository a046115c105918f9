//! Execution-and-normalization pipeline for agent tool calls.
//!
//! Raw tool responses are normalized into [`tools::envelope::ActionResponse`],
//! bounded with [`tools::truncate`] / [`tools::summary`], and planner-generated
//! code runs in an isolated child process through [`sandbox::runner::SandboxRunner`].

pub mod sandbox;
pub mod shared;
pub mod tools;
