use gumdrop::Options;
use httpmock::MockServer;
use std::io::{self, BufRead};

use gander::config::GanderConfiguration;
use gander::metrics::RunSummary;
use gander::scenario::Scenario;
use gander::GanderAttack;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --host <mock-server>
///  --quiet
///  --no-print-summary
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> GanderConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // Keep test output readable.
    if !configuration.contains(&"--verbose") {
        configuration.push("--quiet");
    }
    configuration.push("--no-print-summary");

    // Parse these options to generate a GanderConfiguration.
    GanderConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// A configuration without a host, for tests that never make requests.
#[allow(dead_code)]
pub fn build_offline_configuration(custom: Vec<&str>) -> GanderConfiguration {
    let mut configuration: Vec<&str> = vec!["--quiet", "--no-print-summary"];
    configuration.extend_from_slice(&custom);
    GanderConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Create a GanderAttack object from the configuration and scenarios.
#[allow(dead_code)]
pub fn build_load_test(configuration: GanderConfiguration, scenarios: Vec<Scenario>) -> GanderAttack {
    let mut gander = GanderAttack::initialize_with_config(configuration).unwrap();
    for scenario in scenarios {
        gander = gander.register_scenario(scenario);
    }
    gander
}

/// Run the actual load test, returning the RunSummary.
#[allow(dead_code)]
pub async fn run_load_test(gander_attack: GanderAttack) -> RunSummary {
    gander_attack.execute().await.unwrap()
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
