use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(about = "Deploy model images to managed inference endpoints and verify what they run", long_about = None)]
pub struct Args {
    /// Environment configuration file
    #[arg(long, global = true, env = "KEEL_CONFIG", default_value = "keel.toml")]
    pub config: PathBuf,

    /// Control plane base URL (overrides [control_plane].url)
    #[arg(long, global = true, env = "KEEL_CONTROL_PLANE_URL")]
    pub control_plane_url: Option<String>,

    /// Control plane API token (Authorization: Bearer)
    #[arg(long, global = true, env = "KEEL_CONTROL_PLANE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Abort any waiting after this many seconds
    #[arg(long, global = true)]
    pub deadline_secs: Option<u64>,

    /// Export spans to this OTLP/HTTP endpoint
    #[arg(long, global = true, env = "KEEL_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// OTLP endpoint token
    #[arg(long, global = true, env = "KEEL_OTLP_TOKEN", hide_env_values = true)]
    pub otlp_token: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the image and (re)create the environment's model
    DeployModel {
        #[arg(long)]
        env: String,
        /// Deploy this digest instead of resolving `latest`
        #[arg(long)]
        image_digest: Option<String>,
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        model_name: Option<String>,
    },
    /// Point the environment's endpoint at a new serving configuration
    RolloutEndpoint {
        #[arg(long)]
        env: String,
        #[arg(long)]
        endpoint_name: Option<String>,
        #[arg(long)]
        model_name: Option<String>,
    },
    /// Compare the registry tag with the digest an endpoint runs
    VerifyDeployment {
        #[arg(long)]
        endpoint_name: String,
        #[arg(long)]
        repository_name: String,
        /// Also require the endpoint to run this digest
        #[arg(long)]
        expected_digest: Option<String>,
        /// Registry tag to compare against
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve, deploy the model, roll out and verify in one go
    Pipeline {
        #[arg(long)]
        env: String,
        #[arg(long)]
        image_digest: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved environment configuration
    ShowConfig {
        #[arg(long)]
        env: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_verify() {
        let args = Args::try_parse_from([
            "keel",
            "verify-deployment",
            "--endpoint-name",
            "e1",
            "--repository-name",
            "image-analyzer",
            "--expected-digest",
            "sha256:ab",
            "--deadline-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(args.deadline_secs, Some(60));
        match args.command {
            Command::VerifyDeployment {
                endpoint_name,
                expected_digest,
                tag,
                json,
                ..
            } => {
                assert_eq!(endpoint_name, "e1");
                assert_eq!(expected_digest.as_deref(), Some("sha256:ab"));
                assert_eq!(tag, "latest");
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_env_is_required() {
        assert!(Args::try_parse_from(["keel", "deploy-model"]).is_err());
    }
}
