//! Command-line surface of the agent.
//!
//! Every flag is optional; resolution in [`crate::ClientConfig::resolve`]
//! applies flag > environment variable > built-in default precedence, so a
//! field left `None` here simply defers to the environment.

use clap::Parser;

/// Command-line flags for the imUp agent.
#[derive(Debug, Default, Parser)]
#[command(name = "imup", version, about = "imUp network quality agent")]
pub struct Flags {
    /// api key
    #[arg(long)]
    pub key: Option<String>,

    /// email address
    #[arg(long)]
    pub email: Option<String>,

    /// host id
    #[arg(long = "host-id")]
    pub host_id: Option<String>,

    /// org users group id
    #[arg(long = "group-id")]
    pub group_id: Option<String>,

    /// config version
    #[arg(long = "config-version")]
    pub config_version: Option<String>,

    /// allowed public IPs for connectivity and speed tests
    #[arg(long = "allowlisted-ips")]
    pub allowlisted_ips: Option<String>,

    /// blocked public IPs for connectivity and speed tests
    #[arg(long = "blocklisted-ips")]
    pub blocklisted_ips: Option<String>,

    /// comma separated external ping targets (CIDR or single addresses)
    #[arg(long = "ping-addresses-external")]
    pub ping_addresses_external: Option<String>,

    /// internal gateway ping target
    #[arg(long = "ping-address-internal")]
    pub ping_address_internal: Option<String>,

    /// seconds between ping test cycles
    #[arg(long = "ping-interval")]
    pub ping_interval: Option<u64>,

    /// seconds between dial test cycles
    #[arg(long = "conn-interval")]
    pub conn_interval: Option<u64>,

    /// milliseconds between individual ping requests
    #[arg(long = "ping-delay")]
    pub ping_delay: Option<u64>,

    /// milliseconds between individual dial attempts
    #[arg(long = "conn-delay")]
    pub conn_delay: Option<u64>,

    /// ping requests sent per test cycle
    #[arg(long = "ping-requests")]
    pub ping_requests: Option<usize>,

    /// dial attempts per test cycle
    #[arg(long = "conn-requests")]
    pub conn_requests: Option<usize>,

    /// connectivity data points per batch
    #[arg(long = "imup-data-length")]
    pub imup_data_length: Option<usize>,

    /// run insecure speed tests (ws:// and not wss://)
    #[arg(long = "insecure", num_args = 0..=1, default_missing_value = "true")]
    pub insecure: Option<bool>,

    /// don't run speed tests
    #[arg(long = "no-speed-test", num_args = 0..=1, default_missing_value = "true")]
    pub no_speed_test: Option<bool>,

    /// use disk to store collected data between tests to ensure reliability
    #[arg(long = "nonvolatile", num_args = 0..=1, default_missing_value = "true")]
    pub nonvolatile: Option<bool>,

    /// use ICMP ping for connectivity tests
    #[arg(long = "ping", num_args = 0..=1, default_missing_value = "true")]
    pub ping: Option<bool>,

    /// enable realtime features, enabled by default
    #[arg(long = "realtime", num_args = 0..=1, default_missing_value = "true")]
    pub realtime: Option<bool>,

    /// do not attempt to discover a default gateway
    #[arg(long = "no-gateway-discovery", num_args = 0..=1, default_missing_value = "true")]
    pub no_gateway_discovery: Option<bool>,

    /// log to a file under the user cache directory instead of stderr
    #[arg(long = "log-to-file", num_args = 0..=1, default_missing_value = "true")]
    pub log_to_file: Option<bool>,

    /// how verbose log output should be (debug, info, warn, error)
    #[arg(long)]
    pub verbosity: Option<String>,

    /// connectivity ingest address
    #[arg(long = "connectivity-address")]
    pub connectivity_address: Option<String>,

    /// speed test ingest address
    #[arg(long = "speedtest-address")]
    pub speedtest_address: Option<String>,

    /// realtime liveness check-in address
    #[arg(long = "liveness-address")]
    pub liveness_address: Option<String>,

    /// on-demand speed test poll address
    #[arg(long = "should-run-speedtest-address")]
    pub should_run_speedtest_address: Option<String>,

    /// speed test status update address
    #[arg(long = "speedtest-status-address")]
    pub speedtest_status_address: Option<String>,

    /// speed test results address
    #[arg(long = "speedtest-results-address")]
    pub speedtest_results_address: Option<String>,

    /// realtime authorization address
    #[arg(long = "realtime-auth-address")]
    pub realtime_auth_address: Option<String>,

    /// remote configuration address
    #[arg(long = "realtime-config-address")]
    pub realtime_config_address: Option<String>,
}
