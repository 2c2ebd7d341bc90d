//! The connector subsystem: MX discovery, connection pooling and the
//! bounded acquire/wait loop that hands live SMTP clients to the mailers.

pub(crate) mod pool;
pub(crate) mod preparer;
pub mod resolver;
pub(crate) mod seeker;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use postrider_common::SendEnvelope;
use postrider_smtp::{ClientError, Response, SmtpClient};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::mailer::MailerEvent;
use crate::pipeline::Shared;
use crate::recovery;
use pool::{ClientStatus, LimitQueue, MxServer, PooledClient};

/// How many acquire rounds an envelope may spend waiting for a pooled
/// connection before it is returned for a delayed retry.
pub(crate) const MAX_TRY_CONNECTION_COUNT: u32 = 3;

/// An envelope with its resolved mail servers, headed for a connector.
pub(crate) struct ConnectionEvent {
    pub envelope: SendEnvelope,
    pub servers: Arc<Vec<Arc<MxServer>>>,
    pub source: Option<IpAddr>,
}

/// The connector's two-state loop: after a failed acquire round it either
/// waits and retries or gives the envelope up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Wait,
    GiveUp,
}

pub(crate) const fn advance(try_count: u32, max_tries: u32) -> Attempt {
    if try_count >= max_tries {
        Attempt::GiveUp
    } else {
        Attempt::Wait
    }
}

pub(crate) async fn connect(shared: &Shared, worker_id: usize, event: ConnectionEvent) {
    let ConnectionEvent {
        mut envelope,
        servers,
        source,
    } = event;

    let sender = shared.senders.get(&envelope.message.hostname_from).cloned();
    let helo = sender.as_ref().map_or_else(
        || envelope.message.hostname_from.to_string(),
        |sender| sender.helo_hostname.clone(),
    );

    loop {
        envelope.try_count += 1;
        debug!(
            hostname = %envelope.message.hostname_from,
            id = envelope.message.id,
            try_count = envelope.try_count,
            "connector#{worker_id} tries to find a connection"
        );

        if let Some((mut client, queue, mx)) =
            acquire(shared, sender.as_deref(), &helo, &servers, source).await
        {
            client.wakeup();
            let event = MailerEvent {
                envelope,
                client,
                queue,
                mx,
            };
            if shared.stages.mailer.send(event).await.is_err() {
                warn!("mailer stage is closed");
            }
            return;
        }

        match advance(envelope.try_count, MAX_TRY_CONNECTION_COUNT) {
            Attempt::Wait => {
                debug!(
                    hostname = %envelope.message.hostname_from,
                    id = envelope.message.id,
                    "connector#{worker_id} found no free connection, waiting"
                );
                tokio::time::sleep(shared.timeouts.sleep()).await;
            }
            Attempt::GiveUp => {
                let error = DeliveryError::Transport(format!(
                    "connector can't connect to {}",
                    envelope.message.hostname_to
                ));
                recovery::return_mail(shared, envelope, &error).await;
                return;
            }
        }
    }
}

/// One scan over the MX servers in preference order: pop an idle client,
/// or dial a fresh one where the queue still allows it.
async fn acquire(
    shared: &Shared,
    sender: Option<&crate::sender::SenderRuntime>,
    helo: &str,
    servers: &[Arc<MxServer>],
    source: Option<IpAddr>,
) -> Option<(PooledClient, Arc<LimitQueue>, Arc<MxServer>)> {
    for mx in servers {
        let queue = mx.queue(source);
        let mut candidate = queue.pop();

        let must_dial = match &candidate {
            None => !queue.has_limit(),
            Some(client) => client.status == ClientStatus::Disconnected,
        };

        if must_dial {
            match dial(shared, sender, helo, mx, &queue, source).await {
                Some(fresh) => {
                    let pooled = match candidate.take() {
                        // A dead client keeps its id; only the wire changes.
                        Some(mut dead) => {
                            dead.reopen(fresh);
                            dead
                        }
                        None => {
                            let id = mx.next_client_id();
                            queue.add_max_len();
                            PooledClient::new(id, fresh)
                        }
                    };
                    return Some((pooled, queue, Arc::clone(mx)));
                }
                None => {
                    // Queue latched inside dial; a dead candidate is discarded.
                    continue;
                }
            }
        }

        if let Some(client) = candidate {
            debug!(mx = %mx.hostname, id = client.id, "found free smtp client");
            return Some((client, queue, Arc::clone(mx)));
        }
    }
    None
}

#[derive(Debug, Error)]
enum DialError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("remote rejected session setup with {0}")]
    Rejected(u16),
}

/// Dial one MX: TCP (optionally from a bound source address), greeting,
/// EHLO/HELO, then a STARTTLS upgrade while the server's latch allows it.
///
/// Any failure before a usable session latches the queue: the remote is
/// taken to have signalled a per-IP concurrency cap.
async fn dial(
    shared: &Shared,
    sender: Option<&crate::sender::SenderRuntime>,
    helo: &str,
    mx: &MxServer,
    queue: &LimitQueue,
    source: Option<IpAddr>,
) -> Option<SmtpClient> {
    loop {
        let stream = match timeout(
            shared.timeouts.connection(),
            dial_tcp(source, &mx.hostname, mx.port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                queue.limit_on();
                warn!(mx = %mx.hostname, error = %error, "can't dial");
                return None;
            }
            Err(_) => {
                queue.limit_on();
                warn!(mx = %mx.hostname, "dial timed out");
                return None;
            }
        };

        let mut client = SmtpClient::from_stream(stream, mx.real_name.to_string());

        let ehlo = match timeout(shared.timeouts.hello(), handshake(&mut client, helo)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                queue.limit_on();
                warn!(mx = %mx.hostname, error = %error, "session setup failed");
                return None;
            }
            Err(_) => {
                queue.limit_on();
                warn!(mx = %mx.hostname, "session setup timed out");
                return None;
            }
        };

        if mx.use_tls() {
            if let Some(sender) = sender {
                if ehlo.supports("STARTTLS") {
                    match timeout(shared.timeouts.hello(), client.starttls(&sender.tls)).await {
                        Ok(Ok(response)) if response.is_success() => {
                            // RFC 3207 resets the session; greet again.
                            match timeout(shared.timeouts.hello(), client.ehlo(helo)).await {
                                Ok(Ok(reply)) if reply.is_success() => return Some(client),
                                _ => {
                                    mx.disable_tls();
                                    warn!(mx = %mx.hostname, "EHLO after STARTTLS failed, latching plaintext");
                                    let _ = timeout(shared.timeouts.quit(), client.quit()).await;
                                    continue;
                                }
                            }
                        }
                        _ => {
                            // Not every MTA lets the session continue after a
                            // refused STARTTLS; quit and redial plaintext.
                            mx.disable_tls();
                            debug!(mx = %mx.hostname, "STARTTLS refused, latching plaintext");
                            let _ = timeout(shared.timeouts.quit(), client.quit()).await;
                            continue;
                        }
                    }
                }
            }
        }

        return Some(client);
    }
}

async fn handshake(client: &mut SmtpClient, helo: &str) -> Result<Response, DialError> {
    let greeting = client.read_greeting().await?;
    if !greeting.is_success() {
        return Err(DialError::Rejected(greeting.code));
    }

    let ehlo = client.ehlo(helo).await?;
    if ehlo.is_success() {
        return Ok(ehlo);
    }

    // Some MTAs only speak HELO.
    let reply = client.helo(helo).await?;
    if reply.is_success() {
        Ok(reply)
    } else {
        Err(DialError::Rejected(reply.code))
    }
}

async fn dial_tcp(source: Option<IpAddr>, host: &str, port: u16) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let addr = match source {
        Some(ip) => addrs.iter().copied().find(|a| a.is_ipv4() == ip.is_ipv4()),
        None => addrs.first().copied(),
    }
    .ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {host}"),
        )
    })?;

    match source {
        None => TcpStream::connect(addr).await,
        Some(ip) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(addr).await
        }
    }
}
