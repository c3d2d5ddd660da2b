use std::time::Duration;

use crate::ratelimit::RateLimitPolicy;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Identity of this process on the broadcast bus.
    pub instance_id: String,
    /// Redis connection string. `None` runs single-instance on memory backends.
    pub redis_url: Option<String>,
    /// Namespace for Redis keys and pub/sub channels.
    pub redis_prefix: String,
    /// Base URL of the Identity Service (session validation).
    pub identity_service_url: String,
    /// Base URL of the Persistence Service (chat history, follows, counters).
    pub persistence_service_url: String,
    /// Shared secret required on `/internal/*` routes when set.
    pub internal_api_key: Option<String>,
    pub gateway: GatewaySettings,
}

/// Runtime knobs of the gateway itself, independent of where they came from.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Bound on every Identity/Persistence Service call.
    pub upstream_timeout: Duration,
    /// A transport that shows no inbound traffic for this long is closed.
    pub idle_timeout: Duration,
    /// Cadence of server-initiated pings.
    pub ping_interval: Duration,
    /// Presence entries older than this are swept and treated as offline.
    pub presence_max_age: Duration,
    pub presence_sweep_interval: Duration,
    /// Inbound traffic refreshes presence at most this often per connection.
    pub presence_refresh_interval: Duration,
    pub view_flush_interval: Duration,
    pub connect_limit: RateLimitPolicy,
    pub event_limit: RateLimitPolicy,
    /// Upper bound on followed activity rooms joined at connect time.
    pub follow_fanin_limit: usize,
    /// Frames buffered per connection before new ones are dropped.
    pub outbound_buffer: usize,
    /// How long a long-poll request is held open waiting for frames.
    pub poll_timeout: Duration,
    pub chat_max_chars: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(45),
            ping_interval: Duration::from_secs(20),
            presence_max_age: Duration::from_secs(5 * 60),
            presence_sweep_interval: Duration::from_secs(60),
            presence_refresh_interval: Duration::from_secs(30),
            view_flush_interval: Duration::from_secs(30),
            connect_limit: RateLimitPolicy::new(10, Duration::from_secs(60)),
            event_limit: RateLimitPolicy::new(60, Duration::from_secs(10)),
            follow_fanin_limit: 500,
            outbound_buffer: 256,
            poll_timeout: Duration::from_secs(25),
            chat_max_chars: 1000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = GatewaySettings::default();
        let gateway = GatewaySettings {
            upstream_timeout: secs_var("UPSTREAM_TIMEOUT_SECS", defaults.upstream_timeout),
            idle_timeout: secs_var("IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            ping_interval: secs_var("PING_INTERVAL_SECS", defaults.ping_interval),
            presence_max_age: secs_var("PRESENCE_MAX_AGE_SECS", defaults.presence_max_age),
            presence_sweep_interval: secs_var(
                "PRESENCE_SWEEP_INTERVAL_SECS",
                defaults.presence_sweep_interval,
            ),
            presence_refresh_interval: defaults.presence_refresh_interval,
            view_flush_interval: secs_var("VIEW_FLUSH_INTERVAL_SECS", defaults.view_flush_interval),
            connect_limit: RateLimitPolicy::new(
                parsed_var("CONNECT_RATE_LIMIT", defaults.connect_limit.budget),
                secs_var("CONNECT_RATE_WINDOW_SECS", defaults.connect_limit.window),
            ),
            event_limit: RateLimitPolicy::new(
                parsed_var("EVENT_RATE_LIMIT", defaults.event_limit.budget),
                secs_var("EVENT_RATE_WINDOW_SECS", defaults.event_limit.window),
            ),
            follow_fanin_limit: parsed_var("FOLLOW_FANIN_LIMIT", defaults.follow_fanin_limit),
            outbound_buffer: defaults.outbound_buffer,
            poll_timeout: secs_var("POLL_TIMEOUT_SECS", defaults.poll_timeout),
            chat_max_chars: defaults.chat_max_chars,
        };

        Self {
            port: parsed_var("PORT", 4100),
            instance_id: optional_var("INSTANCE_ID").unwrap_or_else(|| {
                roomcast_common::id::prefixed_ulid(roomcast_common::id::prefix::INSTANCE)
            }),
            redis_url: optional_var("REDIS_URL"),
            redis_prefix: optional_var("REDIS_PREFIX").unwrap_or_else(|| "roomcast".to_string()),
            identity_service_url: required_var("IDENTITY_SERVICE_URL"),
            persistence_service_url: required_var("PERSISTENCE_SERVICE_URL"),
            internal_api_key: optional_var("INTERNAL_API_KEY"),
            gateway,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_var(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
