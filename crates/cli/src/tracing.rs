/// Setup tracing for the CLI.
///
/// Thin wrapper around `mcp_squared_utils::telemetry::setup_telemetry` that
/// picks the default level from the verbosity flag.
pub fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    mcp_squared_utils::telemetry::setup_telemetry(default_level);
}
