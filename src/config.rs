use clap::Parser;
use clap::builder::BoolishValueParser;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;

/// Every knob is also an environment variable so containerised
/// deployments never need a command line.
#[derive(Parser, Debug)]
#[command(version, about = "Out-of-band application security testing responder")]
pub struct Cli {
    /// Store connection string
    #[clap(long, env = "DSSLDRF_CONNSTR")]
    pub connstr: String,

    /// Space-separated IPv6 pool for default AAAA answers
    #[clap(long, env = "DSSLDRF_IPV6", default_value = "")]
    pub ipv6: String,

    /// CA named in default CAA answers
    #[clap(long, env = "DSSLDRF_CAA_ISSUER", default_value = "letsencrypt.org")]
    pub caa_issuer: String,

    /// Contact address for SOA rname and apex CAA extras
    #[clap(long, env = "DSSLDRF_CONTACT_EMAIL")]
    pub contact_email: Option<String>,

    /// Serial number for default SOA answers
    #[clap(long, env = "DSSLDRF_SOA_SERIAL", default_value_t = 2025022101)]
    pub soa_serial: u32,

    /// DNS bind port (ports below 1024 need elevated privileges)
    #[clap(long, env = "LSTNER_DNS_PORT", default_value_t = 53)]
    pub dns_port: u16,

    /// Serve DNS over UDP; false switches to TCP
    #[clap(
        long,
        env = "LSTNER_DNS_UDP",
        default_value = "true",
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub dns_udp: bool,

    /// DNS bind interface
    #[clap(long, env = "LSTNER_DNS_INTERFACE", default_value = "0.0.0.0")]
    pub dns_interface: String,

    /// HTTP bind port
    #[clap(long, env = "LSTNER_HTTP_PORT", default_value_t = 443)]
    pub http_port: u16,

    /// HTTP bind interface
    #[clap(long, env = "LSTNER_HTTP_INTERFACE", default_value = "0.0.0.0")]
    pub http_interface: String,

    /// Terminate TLS on the HTTP listener
    #[clap(
        long,
        env = "LSTNER_HTTP_TLS",
        default_value = "true",
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub http_tls: bool,

    /// TLS certificate chain, PEM
    #[clap(long, env = "DSSLDRF_TLS_CRT_FILE")]
    pub tls_crt: Option<PathBuf>,

    /// TLS private key, PEM
    #[clap(long, env = "DSSLDRF_TLS_KEY_FILE")]
    pub tls_key: Option<PathBuf>,

    /// Prometheus console address; unset disables the console
    #[clap(long, env = "DSSLDRF_CONSOLE")]
    pub console: Option<SocketAddr>,
}

impl Cli {
    pub fn ipv6_pool(&self) -> Vec<Ipv6Addr> {
        self.ipv6
            .split_whitespace()
            .filter_map(|ip| ip.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["dusseldorf", "--connstr", "mongodb://x/db"]).unwrap();
        assert_eq!(cli.dns_port, 53);
        assert!(cli.dns_udp);
        assert_eq!(cli.http_port, 443);
        assert!(cli.http_tls);
        assert!(cli.console.is_none());
        assert!(cli.ipv6_pool().is_empty());
    }

    #[test]
    fn test_boolish_flags() {
        let cli = Cli::try_parse_from([
            "dusseldorf",
            "--connstr",
            "mongodb://x/db",
            "--dns-udp",
            "0",
            "--http-tls",
            "no",
        ])
        .unwrap();
        assert!(!cli.dns_udp);
        assert!(!cli.http_tls);
    }

    #[test]
    fn test_ipv6_pool_parsing() {
        let cli = Cli::try_parse_from([
            "dusseldorf",
            "--connstr",
            "mongodb://x/db",
            "--ipv6",
            "2001:db8::1 2001:db8::2 garbage",
        ])
        .unwrap();
        assert_eq!(
            cli.ipv6_pool(),
            vec![
                "2001:db8::1".parse::<Ipv6Addr>().unwrap(),
                "2001:db8::2".parse::<Ipv6Addr>().unwrap()
            ]
        );
    }
}
