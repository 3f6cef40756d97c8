//! Alerts capability – deduplication guard plus outbound notification.
//!
//! The [`AlertGuard`] is the at-most-once mechanism: for a fixed
//! `(device, alert)` pair exactly one caller ever wins
//! [`AlertGuard::mark_sent`], however many evaluations race for it. Only the
//! winner goes on to notify.
//!
//! Notifications go through an injected [`Notifier`]; nothing here reads
//! process-wide state.
//!
//! Each won claim can also be persisted through an [`AlertAuditSink`],
//! together with the audit snapshots of the capabilities handed to
//! [`AlertsCapability::with_audit_sink`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trackguard_types::TrackError;

use crate::capability::{Capability, FunctionDescriptor, arg_str, unknown_operation};

// ────────────────────────────────────────────────────────────────────────────
// AlertGuard
// ────────────────────────────────────────────────────────────────────────────

/// One-shot claims keyed by `(device, alert id)`. Claims are never reset
/// during the process lifetime.
#[derive(Default)]
pub struct AlertGuard {
    sent: Mutex<HashSet<(String, String)>>,
}

impl AlertGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair. `true` only for the first claim.
    pub async fn mark_sent(&self, imei: &str, alert_id: &str) -> bool {
        let claimed = self
            .sent
            .lock()
            .await
            .insert((imei.to_string(), alert_id.to_string()));
        if claimed {
            info!(imei = %imei, alert_id = %alert_id, "alert claimed");
        } else {
            debug!(imei = %imei, alert_id = %alert_id, "alert already claimed");
        }
        claimed
    }

    pub async fn is_sent(&self, imei: &str, alert_id: &str) -> bool {
        self.sent
            .lock()
            .await
            .contains(&(imei.to_string(), alert_id.to_string()))
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Claim audit trail
// ────────────────────────────────────────────────────────────────────────────

/// One won alert claim, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertAuditRecord {
    pub imei: String,
    pub alert_id: String,
    pub claimed_at: DateTime<Utc>,
    /// Audit contributions keyed by capability name, taken right after the
    /// claim.
    pub snapshot: Value,
}

/// Destination for [`AlertAuditRecord`]s.
#[async_trait]
pub trait AlertAuditSink: Send + Sync {
    async fn record(&self, record: &AlertAuditRecord) -> Result<(), TrackError>;
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemoryAlertAudit {
    records: Mutex<Vec<AlertAuditRecord>>,
}

impl MemoryAlertAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AlertAuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AlertAuditSink for MemoryAlertAudit {
    async fn record(&self, record: &AlertAuditRecord) -> Result<(), TrackError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

struct ClaimAudit {
    sink: Arc<dyn AlertAuditSink>,
    sources: Vec<Arc<dyn Capability>>,
}

impl ClaimAudit {
    async fn persist(&self, imei: &str, alert_id: &str) {
        let mut snapshot = Map::new();
        for source in &self.sources {
            if let Some(audit) = source.as_audit() {
                if let Some(contribution) = audit.audit_snapshot(imei).await {
                    snapshot.insert(source.name().to_string(), contribution);
                }
            }
        }
        let record = AlertAuditRecord {
            imei: imei.to_string(),
            alert_id: alert_id.to_string(),
            claimed_at: Utc::now(),
            snapshot: Value::Object(snapshot),
        };
        // A lost audit row never revokes the claim.
        if let Err(e) = self.sink.record(&record).await {
            warn!(imei = %imei, alert_id = %alert_id, error = %e, "alert audit write failed");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Notifiers
// ────────────────────────────────────────────────────────────────────────────

/// Best-effort outbound notification.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message` to every recipient; returns how many accepted it.
    /// Per-recipient failures are logged, never returned.
    async fn notify(&self, message: &str) -> usize;
}

/// Drops every message. Used when no chat endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, message: &str) -> usize {
        debug!(message = %message, "notifier not configured, message dropped");
        0
    }
}

/// Keeps every message in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> usize {
        self.messages.lock().await.push(message.to_string());
        1
    }
}

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Chat-bot endpoint settings.
#[derive(Clone)]
pub struct NotifierConfig {
    pub bot_token: String,
    pub chat_ids: Vec<String>,
    pub timeout: Duration,
    pub api_base: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_ids: Vec::new(),
            timeout: Duration::from_millis(5000),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }
}

impl NotifierConfig {
    /// Token and at least one recipient present.
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_ids.is_empty()
    }
}

impl fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierConfig")
            .field("bot_token", &if self.bot_token.is_empty() { "" } else { "[REDACTED]" })
            .field("chat_ids", &self.chat_ids)
            .field("timeout", &self.timeout)
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

/// Telegram Bot API notifier: one `sendMessage` POST per chat id.
pub struct TelegramNotifier {
    config: NotifierConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: NotifierConfig) -> Result<Self, TrackError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TrackError::Notification(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    async fn send_one(&self, chat_id: &str, message: &str) -> Result<(), TrackError> {
        let body = SendMessage {
            chat_id,
            text: format!("🚨 {message}"),
            parse_mode: "HTML",
        };
        self.client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|e| {
                if e.is_timeout() {
                    TrackError::Timeout(format!("telegram send to {chat_id}"))
                } else {
                    // Strip the URL: it embeds the bot token.
                    TrackError::Notification(e.without_url().to_string())
                }
            })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> usize {
        if !self.config.is_configured() {
            debug!("telegram not configured, message dropped");
            return 0;
        }
        let mut delivered = 0;
        for chat_id in self.config.chat_ids.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            match self.send_one(chat_id, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(chat_id = %chat_id, error = %e, "telegram delivery failed"),
            }
        }
        delivered
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Capability
// ────────────────────────────────────────────────────────────────────────────

/// Alert bookkeeping and notification, bound as `"actions"`.
pub struct AlertsCapability {
    guard: AlertGuard,
    notifier: Arc<dyn Notifier>,
    audit: Option<ClaimAudit>,
}

const FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "markSent",
        args: &["alertId: string"],
        returns: "bool",
        description: "Claim the alert for this device; true only for the first claim",
    },
    FunctionDescriptor {
        name: "isSent",
        args: &["alertId: string"],
        returns: "bool",
        description: "Whether the alert was already claimed for this device",
    },
    FunctionDescriptor {
        name: "notify",
        args: &["message: string"],
        returns: "int",
        description: "Send a chat notification; returns the number of recipients reached",
    },
    FunctionDescriptor {
        name: "log",
        args: &["message: string"],
        returns: "null",
        description: "Emit an audit log line",
    },
    FunctionDescriptor {
        name: "castString",
        args: &["value: any"],
        returns: "string",
        description: "Render any value as text",
    },
];

impl AlertsCapability {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            guard: AlertGuard::new(),
            notifier,
            audit: None,
        }
    }

    /// Persist every won claim to `sink`, with the audit snapshots of
    /// `sources` for the claiming device.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AlertAuditSink>, sources: Vec<Arc<dyn Capability>>) -> Self {
        self.audit = Some(ClaimAudit { sink, sources });
        self
    }

    pub fn guard(&self) -> &AlertGuard {
        &self.guard
    }

    /// Claim the alert; the winner's claim is written to the audit sink.
    pub async fn mark_sent(&self, imei: &str, alert_id: &str) -> bool {
        let claimed = self.guard.mark_sent(imei, alert_id).await;
        if claimed {
            if let Some(audit) = &self.audit {
                audit.persist(imei, alert_id).await;
            }
        }
        claimed
    }

    pub async fn is_sent(&self, imei: &str, alert_id: &str) -> bool {
        self.guard.is_sent(imei, alert_id).await
    }

    pub async fn notify(&self, message: &str) -> usize {
        self.notifier.notify(message).await
    }

    pub fn audit_log(&self, imei: &str, message: &str) {
        info!(target: "trackguard::audit", imei = %imei, "{message}");
    }
}

/// Text rendering used by rule actions: strings as-is, anything else as JSON.
pub fn cast_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// markSent/isSent accept either (alertId) or (imei, alertId).
fn alert_target<'a>(imei: &'a str, operation: &str, args: &'a [Value]) -> Result<(&'a str, &'a str), TrackError> {
    if args.len() >= 2 {
        Ok((arg_str(operation, args, 0)?, arg_str(operation, args, 1)?))
    } else {
        Ok((imei, arg_str(operation, args, 0)?))
    }
}

#[async_trait]
impl Capability for AlertsCapability {
    fn name(&self) -> &str {
        "alerts"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn context_name(&self) -> &str {
        "actions"
    }

    async fn initialize(&self, _imei: &str) {}

    async fn snapshot(&self) -> Value {
        json!({ "alerts_sent": self.guard.sent_count().await })
    }

    async fn invoke(&self, imei: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError> {
        match operation {
            "markSent" => {
                let (device, alert_id) = alert_target(imei, operation, args)?;
                Ok(json!(self.mark_sent(device, alert_id).await))
            }
            "isSent" => {
                let (device, alert_id) = alert_target(imei, operation, args)?;
                Ok(json!(self.is_sent(device, alert_id).await))
            }
            "notify" => {
                let message = arg_str(operation, args, 0)?;
                Ok(json!(self.notify(message).await))
            }
            "log" => {
                self.audit_log(imei, &cast_string(args.first().unwrap_or(&Value::Null)));
                Ok(Value::Null)
            }
            "castString" => Ok(json!(cast_string(args.first().unwrap_or(&Value::Null)))),
            other => Err(unknown_operation(self.context_name(), other)),
        }
    }

    fn functions(&self) -> &'static [FunctionDescriptor] {
        FUNCTIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCapability;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use trackguard_types::BufferEntry;

    #[tokio::test]
    async fn first_claim_wins() {
        let guard = AlertGuard::new();
        assert!(!guard.is_sent("a", "jammer").await);
        assert!(guard.mark_sent("a", "jammer").await);
        assert!(!guard.mark_sent("a", "jammer").await);
        assert!(guard.is_sent("a", "jammer").await);
        assert!(guard.mark_sent("b", "jammer").await);
        assert!(guard.mark_sent("a", "offline").await);
        assert_eq!(guard.sent_count().await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_yield_exactly_one_winner() -> Result<(), Box<dyn std::error::Error>> {
        for n in [1usize, 2, 16, 64] {
            let guard = Arc::new(AlertGuard::new());
            let mut handles = Vec::with_capacity(n);
            for _ in 0..n {
                let guard = Arc::clone(&guard);
                handles.push(tokio::spawn(async move { guard.mark_sent("dev", "jammer").await }));
            }
            let mut winners = 0;
            for handle in handles {
                if handle.await? {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "n = {n}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn capability_bindings() -> Result<(), Box<dyn std::error::Error>> {
        let recorder = Arc::new(RecordingNotifier::new());
        let alerts = AlertsCapability::new(recorder.clone());

        assert_eq!(alerts.invoke("a", "markSent", &[json!("x")]).await?, json!(true));
        assert_eq!(alerts.invoke("a", "markSent", &[json!("a"), json!("x")]).await?, json!(false));
        assert_eq!(alerts.invoke("a", "isSent", &[json!("x")]).await?, json!(true));
        assert_eq!(alerts.invoke("b", "isSent", &[json!("x")]).await?, json!(false));

        assert_eq!(alerts.invoke("a", "notify", &[json!("hello")]).await?, json!(1));
        assert_eq!(recorder.messages().await, vec!["hello".to_string()]);

        assert_eq!(alerts.invoke("a", "log", &[json!("audit line")]).await?, Value::Null);
        assert_eq!(alerts.invoke("a", "castString", &[json!(42)]).await?, json!("42"));
        assert!(alerts.invoke("a", "notify", &[]).await.is_err());
        Ok(())
    }

    #[test]
    fn cast_string_renders_values() {
        assert_eq!(cast_string(&json!("text")), "text");
        assert_eq!(cast_string(&json!(3.5)), "3.5");
        assert_eq!(cast_string(&json!(true)), "true");
        assert_eq!(cast_string(&Value::Null), "");
    }

    #[test]
    fn notifier_config_debug_redacts_token() {
        let config = NotifierConfig {
            bot_token: "123:secret".into(),
            chat_ids: vec!["42".into()],
            ..NotifierConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn unconfigured_telegram_sends_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let notifier = TelegramNotifier::new(NotifierConfig::default())?;
        assert_eq!(notifier.notify("hi").await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_logged_and_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let notifier = TelegramNotifier::new(NotifierConfig {
            bot_token: "t".into(),
            chat_ids: vec!["1".into(), " 2 ".into()],
            timeout: Duration::from_millis(500),
            api_base: "http://127.0.0.1:9".into(),
        })?;
        assert_eq!(notifier.endpoint(), "http://127.0.0.1:9/bott/sendMessage");
        assert_eq!(notifier.notify("hi").await, 0);
        Ok(())
    }

    async fn read_request_body(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(Vec::new());
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let start = end + 4;
            while buf.len() < start + len {
                let n = socket.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return Ok(buf[start..].to_vec());
        }
    }

    /// Local `sendMessage` endpoint answering 200 for `ok_chat` and 500 for
    /// every other chat id. Returns the base URL and the texts it accepted.
    async fn chat_endpoint(ok_chat: &'static str) -> std::io::Result<(String, Arc<Mutex<Vec<String>>>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let Ok(body) = read_request_body(&mut socket).await else {
                        return;
                    };
                    let message: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                    let status = if message["chat_id"] == ok_chat {
                        seen.lock().await.push(cast_string(&message["text"]));
                        "200 OK"
                    } else {
                        "500 Internal Server Error"
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Ok((base, accepted))
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_the_next() -> Result<(), Box<dyn std::error::Error>> {
        let (api_base, accepted) = chat_endpoint("good").await?;
        let notifier = TelegramNotifier::new(NotifierConfig {
            bot_token: "t".into(),
            chat_ids: vec!["bad".into(), "good".into()],
            timeout: Duration::from_secs(5),
            api_base,
        })?;

        assert_eq!(notifier.notify("engine cut").await, 1);
        assert_eq!(accepted.lock().await.clone(), vec!["🚨 engine cut".to_string()]);
        Ok(())
    }

    async fn buffered(imei: &str) -> Arc<BufferCapability> {
        let buffer = Arc::new(BufferCapability::new());
        buffer
            .record(
                imei,
                BufferEntry {
                    imei: imei.to_string(),
                    datetime: Utc::now(),
                    speed: 40,
                    gsm_signal_strength: 9,
                    positioning_status: "V".into(),
                    is_valid: false,
                    latitude: 25.0,
                    longitude: -103.0,
                },
            )
            .await;
        buffer
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_the_winning_claim_is_audited() -> Result<(), Box<dyn std::error::Error>> {
        let sink = Arc::new(MemoryAlertAudit::new());
        let buffer = buffered("dev").await;
        let alerts = Arc::new(
            AlertsCapability::new(Arc::new(NullNotifier)).with_audit_sink(sink.clone(), vec![buffer as Arc<dyn Capability>]),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let alerts = Arc::clone(&alerts);
            handles.push(tokio::spawn(async move { alerts.mark_sent("dev", "jammer").await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].imei, "dev");
        assert_eq!(records[0].alert_id, "jammer");
        assert_eq!(records[0].snapshot["buffer"]["buffer_window"][0]["gsm_signal"], 9);

        assert!(!alerts.is_sent("other", "jammer").await);
        assert!(alerts.mark_sent("other", "jammer").await);
        assert_eq!(sink.records().await.len(), 2);
        Ok(())
    }

    struct RefusingSink;

    #[async_trait]
    impl AlertAuditSink for RefusingSink {
        async fn record(&self, _record: &AlertAuditRecord) -> Result<(), TrackError> {
            Err(TrackError::Store("disk full".into()))
        }
    }

    #[tokio::test]
    async fn audit_failure_keeps_the_claim() {
        let alerts = AlertsCapability::new(Arc::new(NullNotifier)).with_audit_sink(Arc::new(RefusingSink), Vec::new());
        assert!(alerts.mark_sent("dev", "jammer").await);
        assert!(alerts.is_sent("dev", "jammer").await);
        assert!(!alerts.mark_sent("dev", "jammer").await);
    }
}
