//! Process configuration
//!
//! Every setting is a flag with an environment fallback. Flags win over the
//! environment. Durations use the `1h30m`, `90s`, `500ms` notation.

use std::net::SocketAddr;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Args;

use crate::consul::ConsulConfig;
use crate::kubernetes::{RouteBinding, RouteConfig};
use crate::Error;

/// Settings for the synchronizer
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Consul HTTP address, e.g. http://consul.service:8500
    #[arg(long, env = "CONSUL_ADDR")]
    pub consul_addr: String,

    /// Consul ACL token
    #[arg(long, env = "CONSUL_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    /// Only services carrying this tag are synced
    #[arg(long, env = "CONSUL_TAG", default_value = "kubernetes")]
    pub consul_tag: String,

    /// Namespace derived objects are created in
    #[arg(long, env = "TARGET_NAMESPACE", default_value = "network")]
    pub target_namespace: String,

    /// Listen address for the health server (`:8080` binds all interfaces)
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080", value_parser = parse_listen_addr)]
    pub metrics_addr: SocketAddr,

    /// Interval between full resyncs
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub resync_interval: Duration,

    /// Generate HTTPRoutes for tagged services
    #[arg(
        long,
        env = "ENABLE_HTTPROUTES",
        default_value = "true",
        value_parser = BoolishValueParser::new(),
        action = clap::ArgAction::Set
    )]
    pub enable_httproutes: bool,

    /// Route hostnames are `<service>.<domain-suffix>`
    #[arg(long, env = "DOMAIN_SUFFIX", default_value = "k8s.alexieff.io")]
    pub domain_suffix: String,

    /// Gateway for services tagged with the internal tag
    #[arg(long, env = "INTERNAL_GATEWAY", default_value = "envoy-internal")]
    pub internal_gateway: String,

    /// Gateway for services tagged with the external tag
    #[arg(long, env = "EXTERNAL_GATEWAY", default_value = "envoy-external")]
    pub external_gateway: String,

    /// Namespace of the gateways (defaults to the target namespace)
    #[arg(long, env = "GATEWAY_NAMESPACE")]
    pub gateway_namespace: Option<String>,

    /// Gateway listener (sectionName) routes attach to
    #[arg(long, env = "GATEWAY_LISTENER", default_value = "https")]
    pub gateway_listener: String,

    /// Tag selecting the internal gateway
    #[arg(long, env = "INTERNAL_TAG", default_value = "internal")]
    pub internal_tag: String,

    /// Tag selecting the external gateway
    #[arg(long, env = "EXTERNAL_TAG", default_value = "external")]
    pub external_tag: String,
}

impl Config {
    /// Check values clap cannot check on its own
    pub fn validate(&self) -> Result<(), Error> {
        if self.consul_addr.trim().is_empty() {
            return Err(Error::config("consul address is required"));
        }
        if self.target_namespace.trim().is_empty() {
            return Err(Error::config("target namespace must not be empty"));
        }
        if self.enable_httproutes && self.domain_suffix.trim().is_empty() {
            return Err(Error::config(
                "domain suffix must not be empty when httproutes are enabled",
            ));
        }
        Ok(())
    }

    /// Consul client settings
    pub fn consul_config(&self) -> ConsulConfig {
        let mut config = ConsulConfig::new(&self.consul_addr, &self.consul_tag);
        config.token = self.consul_token.clone().filter(|t| !t.is_empty());
        config
    }

    /// HTTPRoute settings
    pub fn route_config(&self) -> RouteConfig {
        RouteConfig {
            enabled: self.enable_httproutes,
            domain_suffix: self.domain_suffix.clone(),
            gateway_namespace: self
                .gateway_namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| self.target_namespace.clone()),
            listener: self.gateway_listener.clone(),
            bindings: vec![
                RouteBinding::new(&self.internal_tag, &self.internal_gateway),
                RouteBinding::new(&self.external_tag, &self.external_gateway),
            ],
        }
    }
}

/// Parse a listen address, accepting `:port` as all interfaces
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr, String> {
    let value = value.trim();
    let full = match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => value.to_string(),
    };
    full.parse()
        .map_err(|e| format!("invalid listen address {value:?}: {e}"))
}

/// Parse a duration such as `5m`, `1h30m`, `90s` or `250ms`.
///
/// A sequence of number/unit pairs; units are `ms`, `s`, `m` and `h`.
/// Fractions (`1.5h`) are accepted. Zero is rejected since it would make the
/// resync timer spin.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let input = value.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        if number.is_empty() {
            return Err(format!("invalid duration {input:?}: expected a number"));
        }
        let amount: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration {input:?}: bad number {number:?}"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("invalid duration {input:?}: missing unit")),
            other => return Err(format!("invalid duration {input:?}: unknown unit {other:?}")),
        };

        total += Duration::try_from_secs_f64(amount * scale)
            .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
        rest = tail;
    }

    if total.is_zero() {
        return Err(format!("invalid duration {input:?}: must be greater than zero"));
    }
    Ok(total)
}
