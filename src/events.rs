//! Socket push-event schema and dispatch
//!
//! The push transport (external collaborator) delivers named events with a
//! JSON payload. They are decoded into [`SocketEvent`] once at this boundary
//! and translated into item-store patches. A patch driven by a push event
//! applies to every route that currently contains the affected uuid — a file
//! can be visible in its folder, recents and favorites at the same time.
//!
//! Events arrive and apply in order received; there is no reordering buffer.
//! A transient inconsistency from out-of-order transport delivery corrects
//! itself on the next full listing.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::types::{FileRecord, FolderRecord};
use crate::crypto::MetadataCipher;
use crate::decrypt::{decrypt_file_metadata, decrypt_folder_name};
use crate::store::{route_key, screen, ItemStore};
use crate::types::{Item, ItemType, ParentId};

/// Chat/note activity is not part of the item cache; the engine re-broadcasts
/// these to whoever is listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SidecarEvent {
    ChatMessage(ChatMessageNew),
    NoteEdited(NoteContentEdited),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageNew {
    pub conversation: String,
    #[serde(default)]
    pub sender_id: u64,
    /// Encrypted message body; chat UIs hold the conversation key.
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteContentEdited {
    pub note: String,
    /// Encrypted preview of the edited content.
    #[serde(default)]
    pub preview: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UuidPayload {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderRenamePayload {
    pub uuid: String,
    /// Encrypted folder name.
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRenamePayload {
    pub uuid: String,
    /// Encrypted file metadata (carries the new name).
    pub metadata: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColorChangedPayload {
    pub uuid: String,
    pub color: Option<String>,
}

/// One decoded push event.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    FileNew(FileRecord),
    FileRename(FileRenamePayload),
    FileMove(FileRecord),
    FileTrash(UuidPayload),
    FileRestore(FileRecord),
    FileArchived(UuidPayload),
    FolderNew(FolderRecord),
    FolderRename(FolderRenamePayload),
    FolderMove(FolderRecord),
    FolderTrash(UuidPayload),
    FolderRestore(FolderRecord),
    FolderColorChanged(ColorChangedPayload),
    TrashEmpty,
    PasswordChanged,
    ChatMessageNew(ChatMessageNew),
    NoteContentEdited(NoteContentEdited),
    /// Unrecognized event name; kept for forward compatibility.
    Unknown(String),
}

impl SocketEvent {
    /// Decode a named event. Payloads that fail validation decode to `None`
    /// and are dropped by the caller (a malformed push must not poison the
    /// stream).
    pub fn decode(name: &str, data: Value) -> Option<SocketEvent> {
        let event = match name {
            "file-new" => SocketEvent::FileNew(serde_json::from_value(data).ok()?),
            "file-rename" => SocketEvent::FileRename(serde_json::from_value(data).ok()?),
            "file-move" => SocketEvent::FileMove(serde_json::from_value(data).ok()?),
            "file-trash" => SocketEvent::FileTrash(serde_json::from_value(data).ok()?),
            "file-restore" => SocketEvent::FileRestore(serde_json::from_value(data).ok()?),
            "file-archived" => SocketEvent::FileArchived(serde_json::from_value(data).ok()?),
            "folder-new" => SocketEvent::FolderNew(serde_json::from_value(data).ok()?),
            "folder-rename" => SocketEvent::FolderRename(serde_json::from_value(data).ok()?),
            "folder-move" => SocketEvent::FolderMove(serde_json::from_value(data).ok()?),
            "folder-trash" => SocketEvent::FolderTrash(serde_json::from_value(data).ok()?),
            "folder-restore" => SocketEvent::FolderRestore(serde_json::from_value(data).ok()?),
            "folder-color-changed" => {
                SocketEvent::FolderColorChanged(serde_json::from_value(data).ok()?)
            }
            "trash-empty" => SocketEvent::TrashEmpty,
            "passwordChanged" => SocketEvent::PasswordChanged,
            "chatMessageNew" => SocketEvent::ChatMessageNew(serde_json::from_value(data).ok()?),
            "noteContentEdited" => {
                SocketEvent::NoteContentEdited(serde_json::from_value(data).ok()?)
            }
            other => SocketEvent::Unknown(other.to_string()),
        };
        Some(event)
    }
}

/// What applying an event amounted to.
#[derive(Debug)]
pub enum EventOutcome {
    /// Item-store patches were applied to this many routes.
    Patched(usize),
    /// Not an item event — hand to the sidecar broadcast.
    Sidecar(SidecarEvent),
    /// Server-side credential reset; the engine must log out.
    CredentialReset,
    /// Nothing to do (unknown event, or metadata we cannot decrypt).
    Ignored,
}

/// Build an [`Item`] from an encrypted file record, skipping on decrypt
/// failure.
pub fn file_item_from_record(
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    record: &FileRecord,
) -> Option<Item> {
    let meta = decrypt_file_metadata(cipher, keys, &record.metadata, &record.uuid)?;
    Some(Item {
        uuid: record.uuid.clone(),
        item_type: ItemType::File,
        name: meta.name,
        size: if meta.size > 0 { meta.size } else { record.size },
        mime: meta.mime,
        key: meta.key,
        last_modified: meta.last_modified.unwrap_or(record.timestamp),
        parent: ParentId::from(record.parent.clone()),
        favorited: record.favorited == 1,
        color: None,
        receiver_id: record.receiver_id,
        sharer_id: record.sharer_id,
        offline: false,
        region: record.region.clone(),
        bucket: record.bucket.clone(),
        chunks: record.chunks,
        rm: record.rm.clone(),
    })
}

/// Build an [`Item`] from an encrypted folder record, skipping on decrypt
/// failure.
pub fn folder_item_from_record(
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    record: &FolderRecord,
) -> Option<Item> {
    let name = decrypt_folder_name(cipher, keys, &record.name, &record.uuid)?;
    let mut item = Item::folder(record.uuid.clone(), name, ParentId::from(record.parent.clone()));
    item.last_modified = record.timestamp;
    item.favorited = record.favorited == 1;
    item.color = record.color.clone();
    Some(item)
}

/// Apply one decoded event to the item store.
pub async fn apply(
    store: &ItemStore,
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    user_id: u64,
    event: SocketEvent,
) -> EventOutcome {
    match event {
        SocketEvent::FileNew(record) | SocketEvent::FileRestore(record) => {
            match file_item_from_record(cipher, keys, &record) {
                Some(item) => {
                    let drive = route_key(user_id, screen::DRIVE, item.parent.as_wire());
                    store.add(&drive, item.clone()).await;
                    let recents = route_key(user_id, screen::RECENTS, "recents");
                    store.add_front(&recents, item).await;
                    EventOutcome::Patched(2)
                }
                None => EventOutcome::Ignored,
            }
        }
        SocketEvent::FileMove(record) => {
            match file_item_from_record(cipher, keys, &record) {
                Some(item) => {
                    let removed = store.remove_everywhere(&item.uuid).await;
                    let drive = route_key(user_id, screen::DRIVE, item.parent.as_wire());
                    store.add(&drive, item).await;
                    EventOutcome::Patched(removed + 1)
                }
                None => EventOutcome::Ignored,
            }
        }
        SocketEvent::FileRename(payload) => {
            match decrypt_file_metadata(cipher, keys, &payload.metadata, &payload.uuid) {
                Some(meta) => {
                    let touched = store.rename_everywhere(&payload.uuid, &meta.name).await;
                    EventOutcome::Patched(touched)
                }
                None => EventOutcome::Ignored,
            }
        }
        SocketEvent::FileTrash(payload) | SocketEvent::FileArchived(payload) => {
            let touched = store.remove_everywhere(&payload.uuid).await;
            EventOutcome::Patched(touched)
        }
        SocketEvent::FolderNew(record) | SocketEvent::FolderRestore(record) => {
            match folder_item_from_record(cipher, keys, &record) {
                Some(item) => {
                    let drive = route_key(user_id, screen::DRIVE, item.parent.as_wire());
                    store.add(&drive, item).await;
                    EventOutcome::Patched(1)
                }
                None => EventOutcome::Ignored,
            }
        }
        SocketEvent::FolderMove(record) => {
            match folder_item_from_record(cipher, keys, &record) {
                Some(item) => {
                    let removed = store.remove_everywhere(&item.uuid).await;
                    let drive = route_key(user_id, screen::DRIVE, item.parent.as_wire());
                    store.add(&drive, item).await;
                    EventOutcome::Patched(removed + 1)
                }
                None => EventOutcome::Ignored,
            }
        }
        SocketEvent::FolderRename(payload) => {
            match decrypt_folder_name(cipher, keys, &payload.name, &payload.uuid) {
                Some(name) => {
                    let touched = store.rename_everywhere(&payload.uuid, &name).await;
                    EventOutcome::Patched(touched)
                }
                None => EventOutcome::Ignored,
            }
        }
        SocketEvent::FolderTrash(payload) => {
            let touched = store.remove_everywhere(&payload.uuid).await;
            EventOutcome::Patched(touched)
        }
        SocketEvent::FolderColorChanged(payload) => {
            let color = payload.color.clone();
            let touched = store
                .update_everywhere(&payload.uuid, |item| item.color = color.clone())
                .await;
            EventOutcome::Patched(touched)
        }
        SocketEvent::TrashEmpty => {
            store
                .invalidate(&route_key(user_id, screen::TRASH, "trash"))
                .await;
            EventOutcome::Patched(1)
        }
        SocketEvent::PasswordChanged => EventOutcome::CredentialReset,
        SocketEvent::ChatMessageNew(msg) => EventOutcome::Sidecar(SidecarEvent::ChatMessage(msg)),
        SocketEvent::NoteContentEdited(note) => {
            EventOutcome::Sidecar(SidecarEvent::NoteEdited(note))
        }
        SocketEvent::Unknown(name) => {
            debug!("Ignoring unknown socket event '{}'", name);
            EventOutcome::Ignored
        }
    }
}
