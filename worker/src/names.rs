use crate::version::VersionRegistry;
use rand::seq::SliceRandom;
use vigil_lib::{DEFAULT_INSTALLATION, SEPARATOR};

/// Stock worker names, in the order fixed selections hand them out.
pub const DEFAULT_NAMES: &[&str] = &[
    "bob", "alice", "fabri", "elon", "joe", "charlie", "dave", "rosalie", "eve", "frank", "grace", "henry", "ivy",
    "jack", "karen", "larry", "mary", "nancy", "oscar", "paul", "quinn", "rachel", "steve", "tom", "ursula",
    "victor", "wendy", "xavier", "yolanda", "zack", "adam", "bella", "carl", "diana", "eric", "fiona", "george",
    "hannah", "ian", "julia", "keith", "lisa", "mike", "nina", "oliver", "penny", "quentin", "rosa", "sam", "tina",
    "uma", "vince", "walt", "xena", "yara", "zara", "guada",
];

/// The first `count` stock names.
pub fn fixed_names(count: usize) -> Vec<String> {
    DEFAULT_NAMES.iter().take(count).map(|n| n.to_string()).collect()
}

/// `count` distinct stock names in random order.
pub fn random_names(count: usize) -> Vec<String> {
    let mut names: Vec<String> = DEFAULT_NAMES.iter().map(|n| n.to_string()).collect();
    names.shuffle(&mut rand::thread_rng());
    names.truncate(count);
    names
}

/// Pins each name to a random version among the newest `spread` auto-tested
/// ones, producing `name-installation-version` descriptors. A spread of zero
/// leaves the names untouched.
pub fn names_with_versions(names: &[String], registry: &VersionRegistry, spread: usize) -> Vec<String> {
    let versions: Vec<String> = registry
        .list_auto_tested()
        .iter()
        .take(spread)
        .map(|v| v.tag().to_string())
        .collect();
    if versions.is_empty() {
        return names.to_vec();
    }

    let mut rng = rand::thread_rng();
    names
        .iter()
        .map(|name| {
            let version = versions.choose(&mut rng).map(String::as_str).unwrap_or_default();
            if name.contains(SEPARATOR) {
                format!("{}{}{}", name, SEPARATOR, version)
            } else {
                format!("{}{}{}{}{}", name, SEPARATOR, DEFAULT_INSTALLATION, SEPARATOR, version)
            }
        })
        .collect()
}
