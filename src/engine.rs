//! Protocol rewrite engine
//! Edits a parsed getItems response for one device: filters and rewrites the items the
//! vendor sent, pushes library updates, and turns the device's queued actions into items.

use crate::catalog::Catalog;
use crate::config::{Features, ProxyConfig, CDE_PATH, DET_PATH, FIRS_PATH, TODO_PATH};
use crate::device::{Action, DeviceRecord, ItemType, Verb};
use crate::document::{Document, Element, Node};
use crate::rewrite::RewriteRules;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key of the injected servers configuration item
pub const SERVERS_CONFIGURATION_KEY: &str = "KSP.servers.configuration";

/// Suffix of command keys asking the device to upload its syslog
pub const SYSLOG_UPLOAD_MARKER: &str = "SYSLOG";

const DEFAULT_KEY: &str = "NONE";
const DEFAULT_PRIORITY: u32 = 600;

/// An item to add to a response
#[derive(Debug, Clone)]
pub struct NewItem {
    pub verb: Verb,
    pub item_type: ItemType,
    pub key: String,
    pub priority: u32,
    pub text: Option<String>,
    pub url: Option<String>,
    /// Carry the text as a title with a `forced` marker instead of as the item body
    pub forced: bool,
}

impl NewItem {
    pub fn new(verb: Verb, item_type: ItemType) -> Self {
        Self {
            verb,
            item_type,
            key: DEFAULT_KEY.to_string(),
            priority: DEFAULT_PRIORITY,
            text: None,
            url: None,
            forced: false,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn into_element(self) -> Element {
        let mut item = Element::new("item")
            .with_attr("action", self.verb.as_str())
            .with_attr("is_incremental", "false")
            .with_attr("key", self.key)
            .with_attr("priority", self.priority.to_string())
            .with_attr("sequence", "0")
            .with_attr("type", self.item_type.as_str());
        if let Some(url) = self.url {
            item.set_attr("url", url);
        }

        match self.text {
            Some(text) if !text.is_empty() => {
                if self.forced {
                    let mut title = Element::new("title");
                    title.set_text(text);
                    let mut forced = Element::new("forced");
                    forced.set_text("true");
                    item.push(title);
                    item.push(forced);
                } else {
                    item.set_text(text);
                }
            }
            _ => {}
        }

        item
    }
}

/// What filtering did to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filtered {
    Kept,
    Rewritten,
    Removed,
}

/// Rewrites getItems responses
pub struct RewriteEngine {
    features: Features,
    server_url: String,
    rules: RewriteRules,
    catalog: Arc<dyn Catalog>,
}

impl RewriteEngine {
    pub fn new(config: &ProxyConfig, rules: RewriteRules, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            features: config.features.clone(),
            server_url: config.server_url.clone(),
            rules,
            catalog,
        }
    }

    /// Rewrite a response for a device. Returns whether the document was changed.
    ///
    /// A document without an item list is left alone. When anything changed the
    /// declared `total_count` is set to the new number of items.
    pub fn process_response(&self, doc: &mut Document, device: &mut DeviceRecord) -> bool {
        if doc.root.name != "response" {
            return false;
        }

        let count = {
            let items = match doc.root.child_mut("items") {
                Some(items) => items,
                None => return false,
            };

            let mut updated = self.filter_items(items);
            updated |= self.add_updated_books(items, device);
            updated |= self.drain_actions(items, device);

            if !updated {
                return false;
            }
            items.elements().filter(|e| e.name == "item").count()
        };

        match doc.root.child_mut("total_count") {
            Some(total) => total.set_text(count.to_string()),
            None => {
                let mut total = Element::new("total_count");
                total.set_text(count.to_string());
                doc.root.children.insert(0, Node::Element(total));
            }
        }

        true
    }

    /// getItems answer for a device that is not identified yet: a lone snapshot upload
    pub fn first_contact_response(&self) -> Document {
        let mut items = Element::new("items");
        if let Some(item) = self.item_for(&Action::new(Verb::Upload, ItemType::Snap)) {
            items.push(item.into_element());
        }

        let mut total = Element::new("total_count");
        total.set_text(items.elements().count().to_string());

        let mut root = Element::new("response");
        root.push(total);
        root.push(items);
        Document::new(root)
    }

    /// The servers configuration sent to devices, pointing every service at the proxy
    pub fn servers_configuration(&self) -> String {
        let url = &self.server_url;
        let mut lines = vec![
            format!("url.todo={}{}", url, TODO_PATH.trim_matches('/')),
            format!("url.cde={}{}", url, CDE_PATH.trim_matches('/')),
            format!("url.firs={}{}", url, FIRS_PATH.trim_matches('/')),
            format!("url.firs.unauth={}{}", url, FIRS_PATH.trim_matches('/')),
        ];
        if !self.features.allow_logs_upload {
            lines.push(format!("url.messaging.post={}", url));
            lines.push(format!("url.det={}{}", url, DET_PATH.trim_matches('/')));
            lines.push(format!("url.det.unauth={}{}", url, DET_PATH.trim_matches('/')));
        }
        lines.join("\n")
    }

    fn filter_items(&self, items: &mut Element) -> bool {
        let mut changed = false;
        items.children.retain_mut(|node| match node {
            Node::Element(item) if item.name == "item" => match self.filter_item(item) {
                Filtered::Kept => true,
                Filtered::Rewritten => {
                    changed = true;
                    true
                }
                Filtered::Removed => {
                    changed = true;
                    false
                }
            },
            _ => true,
        });
        changed
    }

    fn filter_item(&self, item: &mut Element) -> Filtered {
        let verb = Verb::parse(item.attr("action").unwrap_or_default());
        let item_type = ItemType::parse(item.attr("type").unwrap_or_default());
        let key = item.attr("key").unwrap_or_default().to_string();

        match (verb, item_type) {
            (Verb::Upload, ItemType::Mesg | ItemType::Logs) if !self.features.allow_logs_upload => {
                info!("Dropping log upload item {}", key);
                Filtered::Removed
            }
            (Verb::Upload, _) => self.rewrite_item_url(item),
            (Verb::Download, item_type) => {
                if item.attr("url").is_some() && (item_type == ItemType::Cred || is_uuid(&key)) {
                    let filtered = self.rewrite_item_url(item);
                    if filtered == Filtered::Rewritten {
                        return filtered;
                    }
                }
                debug!("Not rewriting download url for {}", key);
                Filtered::Kept
            }
            (Verb::Get, ItemType::Fwup) if !self.features.allow_firmware_updates => {
                info!("Dropping firmware update item {}", key);
                Filtered::Removed
            }
            (Verb::Snd, ItemType::Cmnd)
                if !self.features.allow_logs_upload && key.ends_with(SYSLOG_UPLOAD_MARKER) =>
            {
                info!("Dropping syslog upload command {}", key);
                Filtered::Removed
            }
            _ => Filtered::Kept,
        }
    }

    fn rewrite_item_url(&self, item: &mut Element) -> Filtered {
        let url = match item.attr("url") {
            Some(url) => url.to_string(),
            None => return Filtered::Kept,
        };

        let new_url = self.rules.rewrite(&url);
        if new_url == url {
            return Filtered::Kept;
        }

        info!("Rewrote url {} => {}", url, new_url);
        item.set_attr("url", new_url);
        Filtered::Rewritten
    }

    fn add_updated_books(&self, items: &mut Element, device: &DeviceRecord) -> bool {
        if !self.features.download_updated_books {
            return false;
        }

        let mut added = false;
        for book in self.catalog.items_needing_update_for(device) {
            // only ebooks can be pushed again
            if ItemType::parse(&book.content_type) != ItemType::Ebok {
                continue;
            }
            warn!(
                "{} ({}) updated in library, telling device {} to download it again",
                book.title, book.key, device.serial
            );
            let item = NewItem::new(Verb::Get, ItemType::Ebok)
                .key(book.key)
                .text(book.title)
                .forced();
            items.push(item.into_element());
            added = true;
        }
        added
    }

    fn drain_actions(&self, items: &mut Element, device: &mut DeviceRecord) -> bool {
        let mut added = false;

        while let Some(action) = device.actions.pop() {
            if has_item(items, &action) {
                debug!("Device {} already has an item for {}", device.serial, action);
                continue;
            }

            let item = match self.item_for(&action) {
                Some(item) => item,
                None => {
                    warn!("Unknown action {} for device {}", action, device.serial);
                    continue;
                }
            };

            items.push(item.into_element());
            if action == Action::new(Verb::Set, ItemType::Scfg) {
                device.configuration_updated = true;
            }
            info!("Sent {} to device {}", action, device.serial);
            added = true;
        }

        added
    }

    fn item_for(&self, action: &Action) -> Option<NewItem> {
        let item = match (&action.verb, &action.item_type) {
            (Verb::Set, ItemType::Scfg) => NewItem::new(Verb::Set, ItemType::Scfg)
                .key(SERVERS_CONFIGURATION_KEY)
                .priority(100)
                .text(self.servers_configuration()),
            (Verb::Upload, ItemType::Snap) => NewItem::new(Verb::Upload, ItemType::Snap)
                .priority(1600)
                .url(format!("{}{}UploadSnapshot", self.server_url, CDE_PATH.trim_start_matches('/'))),
            (Verb::Upload, ItemType::Scfg) => NewItem::new(Verb::Upload, ItemType::Scfg)
                .url(format!("{}{}UploadConfiguration", self.server_url, CDE_PATH.trim_start_matches('/'))),
            _ => return None,
        };
        Some(item)
    }
}

fn has_item(items: &Element, action: &Action) -> bool {
    items.elements().any(|e| {
        e.name == "item"
            && e.attr("action") == Some(action.verb.as_str())
            && e.attr("type") == Some(action.item_type.as_str())
    })
}

/// Only the hyphenated form; `Uuid::parse_str` also takes simple, braced and urn keys
fn is_uuid(key: &str) -> bool {
    key.len() == 36 && Uuid::parse_str(key).is_ok()
}
