//! Device records and the protocol actions queued for them

use crate::certificate::TlsContext;
use std::fmt;
use uuid::Uuid;

/// Prefix of the synthetic serial given to devices we could not identify yet
pub const PROVISIONAL_PREFIX: &str = "provisional-";

/// Maximum stored length of a device cookie, in bytes
pub const MAX_COOKIE_LEN: usize = 64;

/// Protocol verb carried in an item's `action` attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    Upload,
    Download,
    Get,
    Snd,
    Set,
    Other(String),
}

impl Verb {
    pub fn parse(s: &str) -> Self {
        match s {
            "UPLOAD" => Verb::Upload,
            "DOWNLOAD" => Verb::Download,
            "GET" => Verb::Get,
            "SND" => Verb::Snd,
            "SET" => Verb::Set,
            other => Verb::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Upload => "UPLOAD",
            Verb::Download => "DOWNLOAD",
            Verb::Get => "GET",
            Verb::Snd => "SND",
            Verb::Set => "SET",
            Verb::Other(s) => s,
        }
    }
}

/// Item type carried in an item's `type` attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// Telemetry messages
    Mesg,
    Logs,
    /// Device credentials
    Cred,
    /// Firmware update
    Fwup,
    /// Device command
    Cmnd,
    /// Full device snapshot
    Snap,
    /// Servers configuration
    Scfg,
    /// Ebook content
    Ebok,
    Other(String),
}

impl ItemType {
    pub fn parse(s: &str) -> Self {
        match s {
            "MESG" => ItemType::Mesg,
            "LOGS" => ItemType::Logs,
            "CRED" => ItemType::Cred,
            "FWUP" => ItemType::Fwup,
            "CMND" => ItemType::Cmnd,
            "SNAP" => ItemType::Snap,
            "SCFG" => ItemType::Scfg,
            "EBOK" => ItemType::Ebok,
            other => ItemType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Mesg => "MESG",
            ItemType::Logs => "LOGS",
            ItemType::Cred => "CRED",
            ItemType::Fwup => "FWUP",
            ItemType::Cmnd => "CMND",
            ItemType::Snap => "SNAP",
            ItemType::Scfg => "SCFG",
            ItemType::Ebok => "EBOK",
            ItemType::Other(s) => s,
        }
    }
}

/// A (verb, type) instruction to materialize as an item on the next response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Action {
    pub verb: Verb,
    pub item_type: ItemType,
}

impl Action {
    pub fn new(verb: Verb, item_type: ItemType) -> Self {
        Self { verb, item_type }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.verb.as_str(), self.item_type.as_str())
    }
}

/// Pending actions for a device, drained most-recent-first
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    stack: Vec<Action>,
}

impl ActionQueue {
    pub fn push(&mut self, action: Action) {
        self.stack.push(action);
    }

    /// Take the most recently queued action
    pub fn pop(&mut self) -> Option<Action> {
        self.stack.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }
}

/// Everything the proxy knows about one physical device
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub serial: String,
    pub external_id: Option<String>,
    pub last_ip: Option<String>,
    pub last_cookie: Option<String>,
    pub certificate_material: Option<Vec<u8>>,
    pub tls_context: Option<TlsContext>,
    pub context_failed: bool,
    pub actions: ActionQueue,
    pub lto: Option<i64>,
    pub configuration_updated: bool,
}

impl DeviceRecord {
    /// Create a confirmed record for a known serial
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            external_id: None,
            last_ip: None,
            last_cookie: None,
            certificate_material: None,
            tls_context: None,
            context_failed: false,
            actions: ActionQueue::default(),
            lto: None,
            configuration_updated: false,
        }
    }

    /// Create a record for a device seen for the first time, under a synthetic serial
    pub fn provisional(ip: Option<&str>, cookie: Option<&str>) -> Self {
        let mut record = Self::new(format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4().simple()));
        record.last_ip = ip.map(str::to_string);
        record.last_cookie = cookie.map(|c| truncate_cookie(c).to_string());
        record
    }

    pub fn is_provisional(&self) -> bool {
        self.serial.starts_with(PROVISIONAL_PREFIX)
    }

    pub fn mark_context_failed(&mut self) {
        self.context_failed = true;
        self.tls_context = None;
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} ip={} ctx={}}}",
            self.serial,
            self.last_ip.as_deref().unwrap_or("-"),
            if self.context_failed {
                "failed"
            } else if self.tls_context.is_some() {
                "ok"
            } else {
                "none"
            }
        )
    }
}

/// Whether a device last seen with `last_ip`/`last_cookie` is the one behind a connection.
///
/// A cookie match means the stored cookie and the supplied one are equal or one is a
/// prefix of the other (stored cookies are truncated). Empty cookies never match.
pub fn seen_as(last_ip: Option<&str>, last_cookie: Option<&str>, ip: Option<&str>, cookie: Option<&str>) -> bool {
    if let (Some(cookie), Some(stored)) = (cookie, last_cookie) {
        if !cookie.is_empty() && !stored.is_empty() && (cookie.starts_with(stored) || stored.starts_with(cookie)) {
            return true;
        }
    }
    matches!((ip, last_ip), (Some(a), Some(b)) if a == b)
}

/// Cut a cookie down to `MAX_COOKIE_LEN` bytes without splitting a character
pub fn truncate_cookie(cookie: &str) -> &str {
    if cookie.len() <= MAX_COOKIE_LEN {
        return cookie;
    }
    let mut end = MAX_COOKIE_LEN;
    while !cookie.is_char_boundary(end) {
        end -= 1;
    }
    &cookie[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_serial() {
        let d = DeviceRecord::provisional(Some("10.0.0.1"), None);
        assert!(d.is_provisional());
        assert!(!DeviceRecord::new("B0171234567890AB").is_provisional());
        assert_ne!(d.serial, DeviceRecord::provisional(None, None).serial);
    }

    #[test]
    fn test_cookie_prefix_match() {
        let stored = Some("session=abc");
        assert!(seen_as(None, stored, None, Some("session=abc")));
        assert!(seen_as(None, stored, None, Some("session=abcdef")));
        assert!(seen_as(None, stored, None, Some("session=a")));
        assert!(!seen_as(None, stored, None, Some("other=1")));
        assert!(!seen_as(None, stored, None, Some("")));
        assert!(!seen_as(None, stored, None, None));
    }

    #[test]
    fn test_ip_match() {
        let ip = Some("10.0.0.1");
        assert!(seen_as(ip, None, Some("10.0.0.1"), Some("anything")));
        assert!(!seen_as(ip, None, Some("10.0.0.2"), None));
        assert!(!seen_as(None, None, None, None));
    }

    #[test]
    fn test_truncate_cookie() {
        let long = "c".repeat(100);
        assert_eq!(truncate_cookie(&long).len(), MAX_COOKIE_LEN);
        assert_eq!(truncate_cookie("short"), "short");

        // multi-byte char straddling the limit is dropped whole
        let tricky = format!("{}é", "a".repeat(63));
        assert_eq!(truncate_cookie(&tricky), "a".repeat(63));

        let d = DeviceRecord::provisional(None, Some(&long));
        assert_eq!(d.last_cookie.as_deref().map(str::len), Some(MAX_COOKIE_LEN));
    }

    #[test]
    fn test_action_queue_is_a_stack() {
        let mut q = ActionQueue::default();
        q.push(Action::new(Verb::Set, ItemType::Scfg));
        q.push(Action::new(Verb::Upload, ItemType::Snap));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(Action::new(Verb::Upload, ItemType::Snap)));
        assert_eq!(q.pop(), Some(Action::new(Verb::Set, ItemType::Scfg)));
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_verb_and_type_tokens() {
        assert_eq!(Verb::parse("UPLOAD"), Verb::Upload);
        assert_eq!(Verb::parse("UPD_LPRD").as_str(), "UPD_LPRD");
        assert_eq!(ItemType::parse("SCFG"), ItemType::Scfg);
        assert_eq!(ItemType::parse("PDOC").as_str(), "PDOC");
        assert_eq!(Action::new(Verb::Set, ItemType::Scfg).to_string(), "(SET, SCFG)");
    }
}
