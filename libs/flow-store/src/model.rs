use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    Pending,
    Allowed,
    Denied,
}

impl FlowState {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowState::Pending => "pending",
            FlowState::Allowed => "allowed",
            FlowState::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FlowState::Pending),
            "allowed" => Some(FlowState::Allowed),
            "denied" => Some(FlowState::Denied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HintSource {
    DnsSnoop,
    SniPeek,
    ReverseDns,
}

impl HintSource {
    pub fn as_str(self) -> &'static str {
        match self {
            HintSource::DnsSnoop => "dns-snoop",
            HintSource::SniPeek => "sni-peek",
            HintSource::ReverseDns => "reverse-dns",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dns-snoop" => Some(HintSource::DnsSnoop),
            "sni-peek" => Some(HintSource::SniPeek),
            "reverse-dns" => Some(HintSource::ReverseDns),
            _ => None,
        }
    }

    /// Canonical confidence value for a hint detected through this source.
    pub fn confidence(self) -> u8 {
        match self {
            HintSource::SniPeek => 100,
            HintSource::DnsSnoop => 80,
            HintSource::ReverseDns => 20,
        }
    }
}

/// Fingerprint uniquely identifying a learned flow: `(source MAC, transport
/// protocol, destination port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub mac: String,
    pub proto: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub mac: String,
    pub proto: String,
    pub port: u16,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_hostname: Option<String>,
    pub policy_label: Option<String>,
    pub state: FlowState,
    pub scrutiny: bool,
    pub review_until: Option<i64>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub occurrences: i64,
    pub app_label: Option<String>,
    pub vendor: Option<String>,
    pub device_identity: Option<String>,
}

/// Fields known about a new or updated flow sample, used for `upsert`.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub mac: String,
    pub proto: String,
    pub port: u16,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_hostname: Option<String>,
    pub policy_label: Option<String>,
    pub state: FlowState,
    pub app_label: Option<String>,
    pub vendor: Option<String>,
    pub device_identity: Option<String>,
    pub now: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainHint {
    pub id: i64,
    pub flow_id: i64,
    pub domain: String,
    pub confidence: u8,
    pub source: HintSource,
    pub detected_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    LastSeen,
    FirstSeen,
    Occurrences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub state: Option<FlowState>,
    pub mac: Option<String>,
    pub order_by: Option<OrderBy>,
    pub order_dir: Option<OrderDir>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStats {
    pub total: i64,
    pub pending: i64,
    pub allowed: i64,
    pub denied: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeType::Insert),
            "update" => Some(ChangeType::Update),
            "delete" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// A row appended to the replication log on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub version: i64,
    pub table: String,
    pub row_id: i64,
    pub change_type: ChangeType,
    pub fields: serde_json::Value,
    pub timestamp: i64,
}

/// Full-state transfer payload for `export_snapshot`/`import_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: i64,
    pub flows: Vec<Flow>,
    pub hints: Vec<DomainHint>,
}
