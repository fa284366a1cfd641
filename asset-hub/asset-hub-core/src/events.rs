//! Domain events published after a mutation commits.
//!
//! On the wire every event is a flat JSON object: the [`EventRecord`]
//! envelope fields plus the event's own fields, discriminated by `kind`.

use crate::error::{AccessError, AccessResult};
use crate::model::{Folder, Note, Permission, PrincipalId, ResourceKind, ResourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Broker topic an event category is published on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    TeamActivity,
    AssetChanges,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::TeamActivity, Topic::AssetChanges];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TeamActivity => "team.activity",
            Topic::AssetChanges => "asset.changes",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown topic `{s}`"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum DomainEvent {
    MemberAdded {
        team_id: Uuid,
        principal_id: PrincipalId,
    },
    MemberRemoved {
        team_id: Uuid,
        principal_id: PrincipalId,
    },
    FolderCreated {
        folder: Folder,
    },
    FolderUpdated {
        folder: Folder,
    },
    FolderDeleted {
        folder_id: Uuid,
        /// Notes removed together with the folder.
        #[serde(default)]
        cascaded_notes: Vec<Uuid>,
    },
    NoteCreated {
        note: Note,
    },
    NoteUpdated {
        note: Note,
    },
    NoteDeleted {
        note_id: Uuid,
    },
    FolderShared {
        folder_id: Uuid,
        principal_id: PrincipalId,
        permission: Permission,
    },
    NoteShared {
        note_id: Uuid,
        principal_id: PrincipalId,
        permission: Permission,
    },
    FolderUnshared {
        folder_id: Uuid,
        principal_id: PrincipalId,
    },
    NoteUnshared {
        note_id: Uuid,
        principal_id: PrincipalId,
    },
}

impl DomainEvent {
    pub fn shared(resource: ResourceRef, principal_id: &str, permission: Permission) -> Self {
        let principal_id = principal_id.to_string();
        match resource.kind {
            ResourceKind::Folder => DomainEvent::FolderShared {
                folder_id: resource.id,
                principal_id,
                permission,
            },
            ResourceKind::Note => DomainEvent::NoteShared {
                note_id: resource.id,
                principal_id,
                permission,
            },
        }
    }

    pub fn unshared(resource: ResourceRef, principal_id: &str) -> Self {
        let principal_id = principal_id.to_string();
        match resource.kind {
            ResourceKind::Folder => DomainEvent::FolderUnshared {
                folder_id: resource.id,
                principal_id,
            },
            ResourceKind::Note => DomainEvent::NoteUnshared {
                note_id: resource.id,
                principal_id,
            },
        }
    }

    /// Wire discriminator, e.g. `FOLDER_SHARED`.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::MemberAdded { .. } => "MEMBER_ADDED",
            DomainEvent::MemberRemoved { .. } => "MEMBER_REMOVED",
            DomainEvent::FolderCreated { .. } => "FOLDER_CREATED",
            DomainEvent::FolderUpdated { .. } => "FOLDER_UPDATED",
            DomainEvent::FolderDeleted { .. } => "FOLDER_DELETED",
            DomainEvent::NoteCreated { .. } => "NOTE_CREATED",
            DomainEvent::NoteUpdated { .. } => "NOTE_UPDATED",
            DomainEvent::NoteDeleted { .. } => "NOTE_DELETED",
            DomainEvent::FolderShared { .. } => "FOLDER_SHARED",
            DomainEvent::NoteShared { .. } => "NOTE_SHARED",
            DomainEvent::FolderUnshared { .. } => "FOLDER_UNSHARED",
            DomainEvent::NoteUnshared { .. } => "NOTE_UNSHARED",
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            DomainEvent::MemberAdded { .. } | DomainEvent::MemberRemoved { .. } => {
                Topic::TeamActivity
            }
            _ => Topic::AssetChanges,
        }
    }

    /// Team or resource id. Events for the same entity share a key and
    /// therefore a partition, which keeps them in commit order.
    pub fn partition_key(&self) -> String {
        let id = match self {
            DomainEvent::MemberAdded { team_id, .. } | DomainEvent::MemberRemoved { team_id, .. } => {
                *team_id
            }
            DomainEvent::FolderCreated { folder } | DomainEvent::FolderUpdated { folder } => folder.id,
            DomainEvent::NoteCreated { note } | DomainEvent::NoteUpdated { note } => note.id,
            DomainEvent::FolderDeleted { folder_id, .. }
            | DomainEvent::FolderShared { folder_id, .. }
            | DomainEvent::FolderUnshared { folder_id, .. } => *folder_id,
            DomainEvent::NoteDeleted { note_id }
            | DomainEvent::NoteShared { note_id, .. }
            | DomainEvent::NoteUnshared { note_id, .. } => *note_id,
        };
        id.to_string()
    }
}

/// Envelope carrying identity and schema version for one event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_id: Uuid,
    pub version: u32,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl EventRecord {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            version: EVENT_SCHEMA_VERSION,
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn encode(&self) -> AccessResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload read from the broker. Unknown kinds, malformed JSON
    /// and newer schema versions are all `Corrupt`.
    pub fn decode(payload: &[u8]) -> AccessResult<Self> {
        let record: EventRecord = serde_json::from_slice(payload)?;
        if record.version > EVENT_SCHEMA_VERSION {
            return Err(AccessError::Corrupt(format!(
                "unsupported event version {}",
                record.version
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn wire_format_is_flat_with_kind_tag() {
        let folder_id = Uuid::new_v4();
        let record = EventRecord::new(DomainEvent::FolderShared {
            folder_id,
            principal_id: "u2".into(),
            permission: Permission::Write,
        });
        let json: Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();

        assert_eq!(json["kind"], "FOLDER_SHARED");
        assert_eq!(json["folderId"], folder_id.to_string());
        assert_eq!(json["principalId"], "u2");
        assert_eq!(json["permission"], "write");
        assert_eq!(json["version"], 1);
        assert!(json.get("eventId").is_some());
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let event = DomainEvent::NoteDeleted {
            note_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], event.kind());
    }

    #[test]
    fn decode_restores_embedded_representation() {
        let folder = Folder::new("Docs", "team docs", "o1");
        let record = EventRecord::new(DomainEvent::FolderCreated {
            folder: folder.clone(),
        });
        let decoded = EventRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.event, DomainEvent::FolderCreated { folder });
        assert_eq!(decoded.event_id, record.event_id);
    }

    #[test]
    fn garbage_and_future_versions_are_corrupt() {
        assert!(matches!(
            EventRecord::decode(b"{not json"),
            Err(AccessError::Corrupt(_))
        ));
        assert!(matches!(
            EventRecord::decode(br#"{"kind":"TEAM_EXPLODED","eventId":"x"}"#),
            Err(AccessError::Corrupt(_))
        ));

        let mut record = EventRecord::new(DomainEvent::NoteDeleted {
            note_id: Uuid::new_v4(),
        });
        record.version = 2;
        let payload = serde_json::to_vec(&record).unwrap();
        assert!(matches!(
            EventRecord::decode(&payload),
            Err(AccessError::Corrupt(_))
        ));
    }

    #[test]
    fn routing_by_category_and_entity() {
        let team_id = Uuid::new_v4();
        let added = DomainEvent::MemberAdded {
            team_id,
            principal_id: "x".into(),
        };
        assert_eq!(added.topic(), Topic::TeamActivity);
        assert_eq!(added.partition_key(), team_id.to_string());

        let note_id = Uuid::new_v4();
        let shared = DomainEvent::shared(ResourceRef::note(note_id), "u", Permission::Read);
        assert_eq!(shared.topic(), Topic::AssetChanges);
        assert_eq!(shared.partition_key(), note_id.to_string());
        assert_eq!("asset.changes".parse::<Topic>().unwrap(), Topic::AssetChanges);
    }
}
