// act-runner: the local job execution engine.
// Depends on `act-sdk` and `act-common`.
//
// Architecture:
//   RunContext::run → RunContext::executor (Executor pipeline)
//     → start sidecar / job container → StepContext per step
//     → ActionRunner::run_step → Container::exec → teardown

pub mod action_runner;
pub mod command_handler;
pub mod container;
pub mod error;
pub mod expressions;
pub mod git;
pub mod github_context;
pub mod model;
pub mod pipeline;
pub mod run_context;
pub mod step_context;
pub mod steps_context;
