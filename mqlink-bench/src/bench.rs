use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use mqlink::{DisconnectReasonCode, Message, QoS, Session, State};
use mqlink_conf::{Bench, Mode, Settings};
use mqlink_utils::{format_timestamp_millis, timestamp_millis, Counter};

pub(crate) async fn run(settings: &Settings) -> Result<()> {
    let cfg = &settings.bench;
    let qos = QoS::try_from(cfg.qos)?;

    println!("connecting to server...");
    let stream = connect(&cfg.addr, settings.client.connect_timeout).await?;
    let session = Arc::new(Session::new(stream, settings.client.clone()));

    println!("sending MQTT connect...");
    session.connect(&cfg.client_id, cfg.keep_alive).await?;
    println!("connected");
    log::info!("benchmark started at {}", format_timestamp_millis(timestamp_millis()));

    let res = match cfg.mode {
        Mode::Publisher => publisher(&session, cfg, qos).await.map(|elapsed| report("sent", cfg.messages, elapsed)),
        Mode::Subscriber => subscriber(&session, cfg).await.map(|elapsed| report("received", cfg.messages, elapsed)),
    };

    session.disconnect(DisconnectReasonCode::NormalDisconnection).await?;
    res
}

fn report(verb: &str, messages: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { messages as f64 / secs } else { f64::INFINITY };
    println!("{} {} messages in {} ms ({:.3} messages/second)", verb, messages, elapsed.as_millis(), rate);
}

/// TCP connect with Nagle disabled, acknowledgments are tiny.
pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let addr: SocketAddr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| anyhow!("address {} did not resolve", addr))?;

    let stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_nodelay(true)?;
        if timeout.is_zero() {
            socket.connect(&SockAddr::from(addr))?;
        } else {
            socket.connect_timeout(&SockAddr::from(addr), timeout)?;
        }
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    })
    .await??;

    Ok(TcpStream::from_std(stream)?)
}

/// Issues every publish at once and waits for all of them.
pub(crate) async fn publisher(session: &Arc<Session>, cfg: &Bench, qos: QoS) -> Result<Duration> {
    let payload = Bytes::from(cfg.payload.clone());
    let inflight = Arc::new(Counter::new());

    let start = Instant::now();
    let handles: Vec<_> = (0..cfg.messages)
        .map(|_| {
            let session = session.clone();
            let topic = cfg.publish_topic.clone();
            let payload = payload.clone();
            let inflight = inflight.clone();
            tokio::spawn(async move {
                inflight.inc();
                let res = session.publish(topic, payload, qos).await;
                inflight.dec();
                res
            })
        })
        .collect();

    for h in handles {
        h.await??;
    }
    let elapsed = start.elapsed();
    log::info!("publisher done, max concurrent publishes: {}", inflight.max());
    Ok(elapsed)
}

/// Counts inbound messages on the subscribe topic until `cfg.messages` have arrived.
pub(crate) async fn subscriber(session: &Arc<Session>, cfg: &Bench) -> Result<Duration> {
    let received = Arc::new(Counter::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let expected = cfg.messages as isize;
    let counter = received.clone();
    let granted = session
        .subscribe(cfg.subscribe_topic.clone(), QoS::AtLeastOnce, move |_msg: &Message| {
            if counter.incs(1) == expected {
                let _ = tx.send(());
            }
        })
        .await?;
    log::info!("subscribed to {}, granted qos: {:?}", cfg.subscribe_topic, granted);

    let start = Instant::now();
    if expected > 0 {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(_) => break,
                Err(_) if session.state() != State::Connected => {
                    return Err(anyhow!(
                        "connection lost after {} of {} messages",
                        received.count(),
                        cfg.messages
                    ));
                }
                Err(_) => log::debug!("received {} messages so far", received.count()),
            }
        }
    }
    Ok(start.elapsed())
}
