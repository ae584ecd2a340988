//! Process-wide sender ignore list.

use std::collections::HashSet;

/// Exact addresses (`noreply@shop.example`) and whole domains
/// (`@newsletters.example`), compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    addresses: HashSet<String>,
    domains: HashSet<String>,
}

impl IgnoreList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim().to_lowercase();
            if let Some(domain) = entry.strip_prefix('@') {
                if !domain.is_empty() {
                    list.domains.insert(domain.to_string());
                }
            } else if !entry.is_empty() {
                list.addresses.insert(entry);
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.domains.is_empty()
    }

    /// `from` may be a bare address or a display form like `Shop <a@b.c>`.
    pub fn is_ignored(&self, from: &str) -> bool {
        let Some(address) = extract_address(from) else {
            return false;
        };
        if self.addresses.contains(&address) {
            return true;
        }
        address
            .rsplit_once('@')
            .is_some_and(|(_, domain)| self.domains.contains(domain))
    }
}

fn extract_address(from: &str) -> Option<String> {
    let raw = match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => &from[start + 1..end],
        _ => from,
    };
    let address = raw.trim().to_lowercase();
    address.contains('@').then_some(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_addresses_and_domains() {
        let list = IgnoreList::new(["NoReply@Shop.example", "@news.example", " ", "@"]);

        assert!(list.is_ignored("noreply@shop.example"));
        assert!(list.is_ignored("Shop <NOREPLY@shop.example>"));
        assert!(list.is_ignored("weekly@news.example"));
        assert!(!list.is_ignored("someone@shop.example"));
        assert!(!list.is_ignored("weekly@sub.news.example"));
        assert!(!list.is_ignored("not an address"));
    }

    #[test]
    fn empty_list_ignores_nothing() {
        let list = IgnoreList::new(Vec::<String>::new());
        assert!(list.is_empty());
        assert!(!list.is_ignored("a@b.example"));
    }
}
