//! Mock SMTP server for pipeline tests
//!
//! A configurable remote MTA: scripted per-command replies, optional
//! STARTTLS advertisement, and counters for received connections and
//! commands.

#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
};

#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub code: u16,
    pub message: String,
}

impl ScriptedReply {
    fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    fn line(&self) -> String {
        format!("{} {}\r\n", self.code, self.message)
    }
}

#[derive(Clone)]
struct Script {
    greeting: ScriptedReply,
    ehlo_capabilities: Vec<String>,
    mail_from: ScriptedReply,
    rcpt_to: ScriptedReply,
    data: ScriptedReply,
    data_end: ScriptedReply,
    data_end_delay: Option<std::time::Duration>,
    starttls: Option<ScriptedReply>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: ScriptedReply::new(220, "mock ESMTP ready"),
            ehlo_capabilities: vec!["mock.example".to_string(), "SIZE 10240000".to_string()],
            mail_from: ScriptedReply::new(250, "OK"),
            rcpt_to: ScriptedReply::new(250, "OK"),
            data: ScriptedReply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: ScriptedReply::new(250, "OK: queued"),
            data_end_delay: None,
            starttls: None,
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
    connection_limit: Option<usize>,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: &str) -> Self {
        self.script.mail_from = ScriptedReply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: &str) -> Self {
        self.script.rcpt_to = ScriptedReply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: &str) -> Self {
        self.script.data_end = ScriptedReply::new(code, message);
        self
    }

    /// Advertise STARTTLS in EHLO and answer the command with `code`.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: &str) -> Self {
        self.script
            .ehlo_capabilities
            .push("STARTTLS".to_string());
        self.script.starttls = Some(ScriptedReply::new(code, message));
        self
    }

    /// Drop any connection arriving while `limit` are already being
    /// served, like a remote MTA with a per-IP concurrency cap.
    #[must_use]
    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = Some(limit);
        self
    }

    /// Hold the final data reply for `delay`, keeping the session busy.
    #[must_use]
    pub fn with_data_end_delay(mut self, delay: std::time::Duration) -> Self {
        self.script.data_end_delay = Some(delay);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let connections = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(RwLock::new(Vec::new()));
        let script = self.script;
        let connection_limit = self.connection_limit;

        let accept_loop = tokio::spawn({
            let connections = Arc::clone(&connections);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let commands = Arc::clone(&commands);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    if let Some(limit) = connection_limit {
                        if active.load(Ordering::SeqCst) >= limit {
                            // Over capacity: hang up before the greeting.
                            drop(stream);
                            continue;
                        }
                    }
                    connections.fetch_add(1, Ordering::SeqCst);
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now_active, Ordering::SeqCst);

                    let active = Arc::clone(&active);
                    let script = script.clone();
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        serve_connection(stream, script, commands).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            connections,
            max_active,
            commands,
            accept_loop,
        })
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    commands: Arc<RwLock<Vec<String>>>,
    accept_loop: JoinHandle<()>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
            connection_limit: None,
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections that got past the capacity gate and were served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently served connections.
    pub fn max_active_connections(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub async fn commands(&self) -> Vec<String> {
        self.commands.read().await.clone()
    }

    pub async fn saw_command(&self, prefix: &str) -> bool {
        self.commands
            .read()
            .await
            .iter()
            .any(|command| command.starts_with(prefix))
    }

    pub async fn command_count(&self, prefix: &str) -> usize {
        self.commands
            .read()
            .await
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    pub fn shutdown(&self) {
        self.accept_loop.abort();
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve_connection(stream: TcpStream, script: Script, commands: Arc<RwLock<Vec<String>>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if write_half
        .write_all(script.greeting.line().as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut line = String::new();
    let mut in_data = false;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let trimmed = line.trim_end().to_string();

        if in_data {
            if trimmed == "." {
                in_data = false;
                if let Some(delay) = script.data_end_delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = write_half
                    .write_all(script.data_end.line().as_bytes())
                    .await;
            }
            continue;
        }

        commands.write().await.push(trimmed.clone());
        let upper = trimmed.to_uppercase();

        let reply = if upper.starts_with("EHLO") {
            let mut response = String::new();
            let last = script.ehlo_capabilities.len() - 1;
            for (i, capability) in script.ehlo_capabilities.iter().enumerate() {
                let separator = if i == last { ' ' } else { '-' };
                response.push_str(&format!("250{separator}{capability}\r\n"));
            }
            response
        } else if upper.starts_with("HELO") {
            "250 Hello\r\n".to_string()
        } else if upper.starts_with("MAIL FROM") {
            script.mail_from.line()
        } else if upper.starts_with("RCPT TO") {
            script.rcpt_to.line()
        } else if upper.starts_with("DATA") {
            if script.data.code == 354 {
                in_data = true;
            }
            script.data.line()
        } else if upper.starts_with("STARTTLS") {
            script
                .starttls
                .as_ref()
                .map_or_else(|| "502 not implemented\r\n".to_string(), ScriptedReply::line)
        } else if upper.starts_with("RSET") {
            "250 OK\r\n".to_string()
        } else if upper.starts_with("QUIT") {
            let _ = write_half.write_all(b"221 Bye\r\n").await;
            return;
        } else {
            "500 unrecognised\r\n".to_string()
        };

        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}
