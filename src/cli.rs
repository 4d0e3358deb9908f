//! CLI argument parsing for the offmarket-worker binary.

use clap::Parser;

#[derive(Parser)]
#[command(name = "offmarket-worker", about = "Off-market tool backend worker")]
pub struct Cli {
    /// Run a single job (enrichments, emails, maintenance, reports, all),
    /// print the JSON outcome and exit instead of serving.
    #[arg(long)]
    pub job: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_no_args_serves() {
        let cli = Cli::parse_from(["offmarket-worker"]);
        assert!(cli.job.is_none());
    }

    #[test]
    fn test_cli_job_flag_parses() {
        let cli = Cli::parse_from(["offmarket-worker", "--job", "reports"]);
        assert_eq!(cli.job.as_deref(), Some("reports"));
    }
}
