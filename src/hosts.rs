use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use hickory_server::proto::rr::RecordType;
use log::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub domain: String,
    pub ip: IpAddr,
    pub rtype: RecordType,
}

/// Static domain-to-IP overrides, consulted before any upstream is asked.
///
/// Keys are either literal names or `*suffix` wildcards (`*.lab.internal`
/// matches `box.lab.internal`). Writers are serialized by the lock; readers
/// see a consistent snapshot through the read guard.
#[derive(Debug, Default)]
pub struct HostTable {
    entries: RwLock<HashMap<String, Vec<HostEntry>>>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an override. A duplicate `(domain, ip, rtype)` triple leaves
    /// the table unchanged.
    pub fn add(&self, domain: &str, ip: IpAddr, rtype: RecordType) {
        let domain = domain.to_ascii_lowercase();
        let mut entries = self.entries.write().unwrap();
        let list = entries.entry(domain.clone()).or_default();
        let entry = HostEntry { domain, ip, rtype };
        if !list.contains(&entry) {
            list.push(entry);
        }
    }

    /// Removes every entry matching the triple and drops the key once its
    /// list is empty. Removing an absent entry is not an error.
    pub fn remove(&self, domain: &str, ip: IpAddr, rtype: RecordType) {
        let domain = domain.to_ascii_lowercase();
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(&domain) {
            Some(list) => {
                let before = list.len();
                list.retain(|entry| !(entry.ip == ip && entry.rtype == rtype));
                if list.len() == before {
                    warn!("no host entry {domain} {ip} {rtype} to remove");
                }
                if list.is_empty() {
                    entries.remove(&domain);
                }
            }
            None => warn!("no host entry {domain} {ip} {rtype} to remove"),
        }
    }

    /// Looks up an override for `domain`. An exact key wins over wildcards;
    /// among matching `*suffix` keys the longest suffix wins, which keeps the
    /// lookup deterministic when wildcards overlap.
    pub fn get(&self, domain: &str, rtype: RecordType) -> Option<IpAddr> {
        let entries = self.entries.read().unwrap();

        if let Some(list) = entries.get(domain)
            && let Some(entry) = list.iter().find(|entry| entry.rtype == rtype)
        {
            return Some(entry.ip);
        }

        entries
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix('*')
                    .is_some_and(|suffix| domain.ends_with(suffix))
            })
            .filter_map(|(key, list)| {
                list.iter()
                    .find(|entry| entry.rtype == rtype)
                    .map(|entry| (key.len(), entry.ip))
            })
            .max_by_key(|(suffix_len, _)| *suffix_len)
            .map(|(_, ip)| ip)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
