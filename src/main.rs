mod cache;
mod config;
mod defaults;
mod engine;
mod fqdn;
mod listener;
mod metrics;
mod model;
mod passthru;
mod recorder;
mod rules;
mod store;
mod trace;

use crate::defaults::DefaultFactory;
use crate::engine::RuleEngine;
use crate::fqdn::FqdnMatcher;
use crate::listener::dns::ZoneRequestHandler;
use crate::listener::http::{HttpListener, load_tls_config};
use crate::passthru::ReqwestOutbound;
use crate::recorder::Recorder;
use crate::store::{MongoStore, Store};
use anyhow::Context;
use clap::Parser;
use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DNS_TCP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = config::Cli::parse();
    trace::init_tracing();

    let store: Arc<dyn Store> = Arc::new(
        MongoStore::connect(&opt.connstr)
            .await
            .context("store setup failed")?,
    );
    store.ping().await.context("store unreachable at startup")?;
    info!("store connected");

    let defaults = Arc::new(DefaultFactory::new(
        store.clone(),
        opt.ipv6_pool(),
        opt.caa_issuer.clone(),
        opt.contact_email.clone(),
        opt.soa_serial,
    ));
    let matcher = Arc::new(FqdnMatcher::new(store.clone()));
    let outbound = Arc::new(ReqwestOutbound::new().context("outbound client setup failed")?);
    let engine = Arc::new(RuleEngine::new(store.clone(), defaults.clone(), outbound));
    let recorder = Arc::new(Recorder::new(store.clone()));

    let cancel = CancellationToken::new();

    let handler = ZoneRequestHandler::new(
        store.clone(),
        matcher.clone(),
        engine.clone(),
        defaults.clone(),
        recorder.clone(),
    );
    let mut dns_server = ServerFuture::new(handler);
    let dns_addr = format!("{}:{}", opt.dns_interface, opt.dns_port);
    if opt.dns_udp {
        let socket = UdpSocket::bind(&dns_addr)
            .await
            .with_context(|| format!("unable to bind {}/udp", dns_addr))?;
        dns_server.register_socket(socket);
    } else {
        let listener = TcpListener::bind(&dns_addr)
            .await
            .with_context(|| format!("unable to bind {}/tcp", dns_addr))?;
        dns_server.register_listener(listener, DNS_TCP_TIMEOUT);
    }
    info!(
        "dns listening on {}/{}",
        dns_addr,
        if opt.dns_udp { "udp" } else { "tcp" }
    );
    tokio::spawn(async move {
        if let Err(e) = dns_server.block_until_done().await {
            error!("dns server terminated: {}", e);
        }
    });

    let tls = if opt.http_tls {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let crt = opt
            .tls_crt
            .as_deref()
            .context("DSSLDRF_TLS_CRT_FILE not set while tls is on")?;
        let key = opt
            .tls_key
            .as_deref()
            .context("DSSLDRF_TLS_KEY_FILE not set while tls is on")?;
        Some(TlsAcceptor::from(load_tls_config(crt, key)?))
    } else {
        None
    };
    let scheme = if tls.is_some() { "https" } else { "http" };
    let http_addr = format!("{}:{}", opt.http_interface, opt.http_port);
    let http_socket = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("unable to bind {}", http_addr))?;
    info!("{} listening on {}", scheme, http_addr);
    let http = Arc::new(HttpListener::new(matcher, engine, recorder, tls));
    tokio::spawn(http.serve(http_socket, cancel.child_token()));

    if let Some(console) = opt.console {
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve_console(console).await {
                error!("metrics console terminated: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();

    Ok(())
}
