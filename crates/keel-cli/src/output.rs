use keel_common::{Endpoint, EnvironmentConfig, ModelResource, VerificationResult};
use keel_deploy::{DeployError, PipelineReport, StageError};

pub fn print_model(model: &ModelResource) {
    println!("✓ Model '{}' references {}", model.name, model.artifact);
    println!("  {:<20} {}", "Execution role", model.execution_identity);
    if !model.environment.is_empty() {
        println!("  Environment:");
        for (k, v) in &model.environment {
            println!("    {k}={v}");
        }
    }
}

pub fn print_endpoint(endpoint: &Endpoint) {
    println!("✓ Endpoint '{}' is {}", endpoint.name, endpoint.status);
    println!("  {:<20} {}", "Configuration", endpoint.active_configuration);
    println!(
        "  {:<20} {}",
        "Deployed image",
        endpoint.deployed_image.as_deref().unwrap_or("N/A")
    );
}

pub fn print_verification(result: &VerificationResult) {
    println!("\n=== Deployment Verification: {} ===", result.endpoint_name);
    println!("  {:<20} {}", "Registry digest", result.registry_digest);
    println!("  {:<20} {}", "Deployed digest", result.deployed_digest);
    if let Some(expected) = &result.expected_digest {
        println!("  {:<20} {}", "Expected digest", expected);
    }
    println!();
    if result.matched {
        println!("✓ Endpoint is running the expected image");
    } else {
        if !result.registry_matches() {
            println!("✗ Registry and deployed digests differ");
        }
        if result.expected_matches() == Some(false) {
            println!("✗ Deployed digest differs from the expected digest");
        }
    }
}

pub fn print_pipeline(report: &PipelineReport) {
    println!("\n=== Pipeline: {} ===", report.environment);
    println!("✓ Resolved {}", report.artifact);
    print_model(&report.model);
    print_endpoint(&report.endpoint);
    print_verification(&report.verification);
}

pub fn print_environment(env: &EnvironmentConfig) {
    println!("\n=== Environment: {} ===", env.name);
    println!("  {:<22} {}", "Registry", env.registry);
    println!("  {:<22} {}", "Repository", env.repository);
    println!("  {:<22} {}", "Execution role", env.execution_role);
    println!("  {:<22} {}", "Model", env.model_name);
    println!("  {:<22} {}", "Endpoint", env.endpoint_name);
    println!(
        "  {:<22} {} x {} ({})",
        "Instances", env.instance.instance_count, env.instance.instance_type, env.instance.variant_name
    );
    println!(
        "  {:<22} download {}s, startup {}s",
        "Timeouts",
        env.instance.timeouts.model_data_download_secs,
        env.instance.timeouts.container_startup_health_check_secs
    );
    println!("  {:<22} {}", "Force refresh", env.force_refresh);
    let p = &env.polling;
    println!(
        "  {:<22} settle {}s, {} x {}s",
        "Deletion polling", p.deletion_settle_secs, p.deletion_attempts, p.deletion_interval_secs
    );
    println!(
        "  {:<22} {} x {}s",
        "Rollout polling", p.rollout_attempts, p.rollout_interval_secs
    );
    if !env.model_environment.is_empty() {
        println!("  Model environment:");
        for (k, v) in &env.model_environment {
            println!("    {k}={v}");
        }
    }
}

pub fn print_stage_error(err: &StageError) {
    eprintln!("✗ {} stage failed: {}", err.stage, err.source);
    print_hint(&err.source);
}

pub fn print_error(err: &DeployError) {
    eprintln!("✗ {err}");
    print_hint(err);
}

fn print_hint(err: &DeployError) {
    if err.is_retryable() {
        eprintln!("  (retryable: every stage re-reads remote state, so re-running is safe)");
    }
}
