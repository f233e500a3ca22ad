// act-common: Shared configuration and infrastructure for the local job runner.
// Consumed by `act-runner`.

pub mod action_command;
pub mod config;
pub mod constants;
pub mod job_result;
pub mod logging;
pub mod secret_masker;

pub use action_command::ActionCommand;
pub use config::Config;
pub use job_result::JobResult;
pub use logging::LogSettings;
pub use secret_masker::SecretMasker;
