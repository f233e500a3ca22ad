// act-sdk: Foundation layer for the local job runner.
// This crate has no dependencies on the other workspace crates and provides
// process invocation, trace output and line-oriented output streaming.

pub mod line_writer;
pub mod process_invoker;
pub mod trace;

pub use line_writer::{LineHandler, LineWriter};
pub use process_invoker::{
    ProcessCancelledError, ProcessDataReceivedEventArgs, ProcessExitCodeError, ProcessInvoker,
};
pub use trace::{TraceWriter, TracingTraceWriter};
