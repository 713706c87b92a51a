//! Entry point for the coreduce binary.
//! Parses arguments, detects the cooperative environment and runs this worker's share.

use clap::Parser;
use coreduce::cli::Args;
use coreduce::logging::init_tracing;
use coreduce::ReductionRun;
use std::process::ExitCode;
use tracing::error;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.into_config();
    match ReductionRun::from_config(&config).execute().await {
        Ok(report) => {
            println!(
                "✅ {} of '{}' saved to '{}' in {} ({}, {} units)",
                report.reduction,
                config.input,
                config.output,
                config.store_path.display(),
                report.capability,
                report.job_list.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            let mut message = e.to_string();
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                message.push_str(": ");
                message.push_str(&cause.to_string());
                source = cause.source();
            }
            error!(kind = e.kind(), "{message}");
            ExitCode::FAILURE
        }
    }
}
