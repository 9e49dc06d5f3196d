mod args;
mod config;
mod output;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use keel_common::telemetry::init_tracing;
use keel_common::KeelConfig;
use keel_control::{HostingPlatform, HttpControlPlane, Registry};
use keel_deploy::{ArtifactResolver, Clock, Deployer, DriftVerifier, EnsureMatch, TokioClock};

use crate::args::{Args, Command};
use crate::output::{
    print_endpoint, print_environment, print_error, print_model, print_pipeline, print_stage_error,
    print_verification,
};

struct Remote {
    registry: Arc<dyn Registry>,
    hosting: Arc<dyn HostingPlatform>,
    clock: Arc<dyn Clock>,
}

impl Remote {
    fn connect(url_flag: Option<&str>, token: Option<String>, file: &KeelConfig) -> Result<Self> {
        let url = config::control_plane_url(url_flag, file)?;
        tracing::debug!(%url, "using control plane");
        let cp = Arc::new(HttpControlPlane::new(url, token)?);
        Ok(Self {
            registry: cp.clone(),
            hosting: cp,
            clock: Arc::new(TokioClock),
        })
    }
}

/// Cancelled on Ctrl-C or when the optional deadline passes.
fn cancellation(deadline: Option<Duration>) -> CancellationToken {
    let token = CancellationToken::new();

    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping at the next poll");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = deadline {
        let on_deadline = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracing::warn!(?deadline, "deadline reached, stopping");
            on_deadline.cancel();
        });
    }

    token
}

async fn run(args: Args) -> Result<ExitCode> {
    let file = config::load(&args.config)?;
    let cancel = cancellation(args.deadline_secs.map(Duration::from_secs));
    let url_flag = args.control_plane_url.as_deref();

    match args.command {
        Command::ShowConfig { env } => {
            let env = config::environment(&file, &args.config, &env, None, None, None)?;
            print_environment(&env);
            Ok(ExitCode::SUCCESS)
        }
        Command::DeployModel {
            env,
            image_digest,
            repository,
            model_name,
        } => {
            let env = config::environment(&file, &args.config, &env, repository, model_name, None)?;
            let digest = config::digest(image_digest.as_deref())?;
            let remote = Remote::connect(url_flag, args.token, &file)?;
            let deployer = Deployer::new(remote.registry, remote.hosting, remote.clock, &env);

            match deployer.deploy_model(&env, digest, &cancel).await {
                Ok(model) => {
                    print_model(&model);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_stage_error(&e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::RolloutEndpoint {
            env,
            endpoint_name,
            model_name,
        } => {
            let env = config::environment(&file, &args.config, &env, None, model_name, endpoint_name)?;
            let remote = Remote::connect(url_flag, args.token, &file)?;
            let deployer = Deployer::new(remote.registry, remote.hosting, remote.clock, &env);

            match deployer.rollout_endpoint(&env, &cancel).await {
                Ok(endpoint) => {
                    print_endpoint(&endpoint);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_stage_error(&e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::VerifyDeployment {
            endpoint_name,
            repository_name,
            expected_digest,
            tag,
            json,
        } => {
            let expected = config::digest(expected_digest.as_deref())?;
            let remote = Remote::connect(url_flag, args.token, &file)?;
            let resolver = ArtifactResolver::new(remote.registry, remote.clock.clone());
            let verifier = DriftVerifier::new(resolver, remote.hosting, remote.clock).with_tag(tag);

            match verifier
                .verify(&endpoint_name, &repository_name, expected.as_ref(), &cancel)
                .await
            {
                Ok(result) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        print_verification(&result);
                    }
                    Ok(match result.ensure_match() {
                        Ok(()) => ExitCode::SUCCESS,
                        Err(_) => ExitCode::FAILURE,
                    })
                }
                Err(e) => {
                    print_error(&e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Pipeline {
            env,
            image_digest,
            json,
        } => {
            let env = config::environment(&file, &args.config, &env, None, None, None)?;
            let digest = config::digest(image_digest.as_deref())?;
            let remote = Remote::connect(url_flag, args.token, &file)?;
            let deployer = Deployer::new(remote.registry, remote.hosting, remote.clock, &env);

            match deployer.run(&env, digest, &cancel).await {
                Ok(report) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        print_pipeline(&report);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_stage_error(&e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let provider = init_tracing(
        "keel",
        &args.log_level,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("✗ {e:#}");
            ExitCode::FAILURE
        }
    };

    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush spans: {e}");
        }
    }
    code
}
