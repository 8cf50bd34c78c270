use std::collections::BTreeMap;

/// Tag used for stores no portal claims.
pub const DEFAULT_TAG: &str = "lxp-sync";

/// Background sync tags and the stores each one drains.
#[derive(Debug, Clone, Default)]
pub struct SyncTags {
  tags: BTreeMap<String, Vec<String>>,
}

impl SyncTags {
  pub fn new(tags: BTreeMap<String, Vec<String>>) -> Self {
    Self { tags }
  }

  /// Tag to register when a write to `store_name` is queued.
  pub fn tag_for_store(&self, store_name: &str) -> &str {
    self
      .tags
      .iter()
      .find(|(_, stores)| stores.iter().any(|s| s == store_name))
      .map(|(tag, _)| tag.as_str())
      .unwrap_or(DEFAULT_TAG)
  }

  /// Drain scopes for a tag; `None` means every store.
  pub fn stores_for_tag(&self, tag: &str) -> Vec<Option<String>> {
    match self.tags.get(tag) {
      Some(stores) if !stores.is_empty() => stores.iter().cloned().map(Some).collect(),
      _ => vec![None],
    }
  }
}
