//! Schemata text encoding.
//!
//! The kernel fixes this format: one line per resource kind, each
//! `RES:dom=value;dom=value`, hexadecimal way masks for cache resources
//! and decimal throttles for `MB`. It is reproduced byte-exactly here.

use cachet_common::{Bitmap, CachetError, CachetResult};

/// L3 cache resource line.
pub const L3: &str = "L3";
/// L3 code mask line under CDP.
pub const L3_CODE: &str = "L3CODE";
/// L3 data mask line under CDP.
pub const L3_DATA: &str = "L3DATA";
/// Memory-bandwidth throttle line.
pub const MB: &str = "MB";

/// A single domain entry on a schemata line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Cache/bandwidth domain id (one per socket, typically).
    pub id: u32,
    /// Mask or throttle value, verbatim.
    pub value: String,
}

/// One resource line of a schemata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemataLine {
    /// Resource kind (`L3`, `L3CODE`, `L3DATA`, `MB`, ...).
    pub resource: String,
    /// Per-domain values in file order.
    pub domains: Vec<Domain>,
}

/// The parsed or to-be-written content of a group's schemata file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schemata {
    /// Resource lines in file order.
    pub lines: Vec<SchemataLine>,
}

impl Schemata {
    /// An empty schemata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cache resource line carrying the same way mask in every
    /// listed domain.
    pub fn push_cache(&mut self, resource: &str, domains: &[u32], mask: &Bitmap) {
        let value = mask.to_hex();
        self.lines.push(SchemataLine {
            resource: resource.to_string(),
            domains: domains
                .iter()
                .map(|id| Domain {
                    id: *id,
                    value: value.clone(),
                })
                .collect(),
        });
    }

    /// Append an `MB` throttle line carrying the same value in every
    /// listed domain.
    pub fn push_throttle(&mut self, domains: &[u32], value: u32) {
        self.lines.push(SchemataLine {
            resource: MB.to_string(),
            domains: domains
                .iter()
                .map(|id| Domain {
                    id: *id,
                    value: value.to_string(),
                })
                .collect(),
        });
    }

    /// The line for a resource kind, if present.
    #[must_use]
    pub fn line(&self, resource: &str) -> Option<&SchemataLine> {
        self.lines.iter().find(|line| line.resource == resource)
    }

    /// Render into the kernel text format, one newline-terminated line per
    /// resource.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.resource);
            out.push(':');
            let domains: Vec<String> = line
                .domains
                .iter()
                .map(|domain| format!("{}={}", domain.id, domain.value))
                .collect();
            out.push_str(&domains.join(";"));
            out.push('\n');
        }
        out
    }

    /// Parse kernel schemata text. Leading whitespace per line (as the
    /// kernel emits) is tolerated; empty lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CachetError::InvalidMask`] for a line that does not match
    /// `RES:dom=value;...`.
    pub fn parse(text: &str) -> CachetResult<Self> {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (resource, rest) =
                trimmed
                    .split_once(':')
                    .ok_or_else(|| CachetError::InvalidMask {
                        value: raw.to_string(),
                    })?;
            let mut domains = Vec::new();
            for pair in rest.split(';') {
                let (id, value) =
                    pair.trim()
                        .split_once('=')
                        .ok_or_else(|| CachetError::InvalidMask {
                            value: raw.to_string(),
                        })?;
                let id: u32 = id.parse().map_err(|_| CachetError::InvalidMask {
                    value: raw.to_string(),
                })?;
                domains.push(Domain {
                    id,
                    value: value.to_string(),
                });
            }
            lines.push(SchemataLine {
                resource: resource.to_string(),
                domains,
            });
        }
        Ok(Self { lines })
    }
}
