use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A signed, optionally-expiring record of a task's original mandate.
/// Consulted on every tool call for drift detection; the signature covers
/// every field a drift decision depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentCapsule {
    pub capsule_id: String,
    pub mandate: String,
    pub mandate_hash: String,
    pub mandate_keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_action_categories: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub signature: String,
}

impl IntentCapsule {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    /// Canonical serialization the signature is computed over. Field order is
    /// fixed; the unit separator keeps fields from bleeding into each other.
    fn canonical(&self) -> String {
        let categories = self
            .allowed_action_categories
            .as_ref()
            .map(|c| c.join(","))
            .unwrap_or_default();
        [
            self.capsule_id.as_str(),
            self.mandate.as_str(),
            self.mandate_hash.as_str(),
            &self.mandate_keywords.join(","),
            &categories,
            &self.created_at.to_rfc3339(),
            &self
                .expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ]
        .join("\u{1f}")
    }
}

/// Holds the per-process HMAC secret. Generated at boot, never persisted:
/// capsules signed by a previous process fail verification and are replaced.
pub struct CapsuleSigner {
    secret: [u8; 32],
}

impl CapsuleSigner {
    pub fn new_random() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    pub fn create(
        &self,
        mandate: &str,
        allowed_action_categories: Option<Vec<String>>,
        ttl: Option<Duration>,
    ) -> IntentCapsule {
        let created_at = Utc::now();
        let mut capsule = IntentCapsule {
            capsule_id: format!("cap-{}", Uuid::new_v4()),
            mandate: mandate.to_string(),
            mandate_hash: hex(&Sha256::digest(mandate.as_bytes())),
            mandate_keywords: extract_keywords(mandate),
            allowed_action_categories,
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
            signature: String::new(),
        };
        capsule.signature = hex(&hmac_sha256(&self.secret, capsule.canonical().as_bytes()));
        capsule
    }

    pub fn verify(&self, capsule: &IntentCapsule) -> bool {
        let expected = hex(&hmac_sha256(&self.secret, capsule.canonical().as_bytes()));
        // Length is constant for SHA-256 output, so a simple comparison folds
        // to a fixed number of byte comparisons.
        constant_time_eq(expected.as_bytes(), capsule.signature.as_bytes())
    }
}

/// HMAC-SHA256 per RFC 2104, composed from the sha2 primitives.
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK: usize = 64;
    let mut padded = [0u8; BLOCK];
    if key.len() > BLOCK {
        padded[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        padded[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let mut ipad = [0u8; BLOCK];
    for (i, b) in padded.iter().enumerate() {
        ipad[i] = b ^ 0x36;
    }
    inner.update(ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let mut opad = [0u8; BLOCK];
    for (i, b) in padded.iter().enumerate() {
        opad[i] = b ^ 0x5c;
    }
    outer.update(opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "he", "her",
    "his", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "our", "please", "she",
    "so", "that", "the", "their", "them", "then", "they", "this", "to", "us", "was", "we", "were",
    "will", "with", "you", "your",
];

/// Lowercased, stop-word-filtered, deduplicated keyword set for overlap
/// scoring.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '/' && c != '.')
        .filter(|w| w.len() > 1)
    {
        let lower = word.to_lowercase();
        if STOP_WORDS.contains(&lower.as_str()) {
            continue;
        }
        seen.insert(lower);
    }
    seen.into_iter().collect()
}

pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let set_a: std::collections::BTreeSet<_> = a.iter().collect();
    let set_b: std::collections::BTreeSet<_> = b.iter().collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[derive(Debug, Clone)]
pub struct DriftCheck {
    pub drifted: bool,
    pub overlap: f64,
    pub reason: Option<String>,
}

impl IntentCapsule {
    /// Compare a proposed action against the mandate. Category membership is
    /// checked first when a category allow-list was captured; otherwise the
    /// decision rests on keyword overlap.
    pub fn check_drift(&self, category: &str, action_detail: &str, threshold: f64) -> DriftCheck {
        if let Some(allowed) = &self.allowed_action_categories {
            if !allowed.iter().any(|c| c == category || c == "*") {
                return DriftCheck {
                    drifted: true,
                    overlap: 0.0,
                    reason: Some(format!(
                        "action category `{category}` is outside the capsule's allowed categories"
                    )),
                };
            }
        }
        let action_keywords = extract_keywords(action_detail);
        if self.mandate_keywords.is_empty() || action_keywords.is_empty() {
            return DriftCheck {
                drifted: false,
                overlap: 1.0,
                reason: None,
            };
        }
        let overlap = jaccard(&self.mandate_keywords, &action_keywords);
        if overlap < threshold {
            DriftCheck {
                drifted: true,
                overlap,
                reason: Some(format!(
                    "action keywords overlap mandate by {overlap:.2}, below threshold {threshold:.2}"
                )),
            }
        } else {
            DriftCheck {
                drifted: false,
                overlap,
                reason: None,
            }
        }
    }
}
