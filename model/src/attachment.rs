//! Files attached to QC records: certificates, lab reports, photographs and so on.
//!
//! Metadata lives in the `attachments` table; file contents live in an [`AttachmentStore`] on
//! disk, under a generated name.

use crate::{
    audit,
    error::{Problems, StorageSnafu},
    record::{self, parse_column, Record},
    schema::{self, ATTACHMENTS},
    sql::db::{Connection, Executor, Op, Order, Row, Select, Table, Value},
    Error, Result,
};
use async_std::{fs, path::PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{future::Future, io::ErrorKind};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// Content types accepted for attachments.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "text/plain",
    "text/csv",
    "application/octet-stream",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// The kinds of record which can own attachments.
#[derive(
    Clone, Copy, Debug, Display, EnumIter, EnumString, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Inspection,
    ChemicalTest,
    HardnessTest,
    Calibration,
}

impl OwnerKind {
    /// The table holding owners of this kind.
    pub fn table(&self) -> &'static Table<'static> {
        match self {
            Self::Inspection => &schema::INSPECTIONS,
            Self::ChemicalTest => &schema::CHEMICAL_TESTS,
            Self::HardnessTest => &schema::HARDNESS_TESTS,
            Self::Calibration => &schema::CALIBRATIONS,
        }
    }

    /// Look up an owner kind by the name of its table.
    pub fn from_table(name: &str) -> Option<Self> {
        Self::iter().find(|kind| kind.table().name == name)
    }
}

/// The record owning an attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Owner {
    pub kind: OwnerKind,
    pub id: i64,
}

impl Owner {
    pub fn new(kind: OwnerKind, id: i64) -> Self {
        Self { kind, id }
    }
}

/// Metadata about an attached file.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Attachment {
    pub id: i64,
    pub owner: Owner,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// Name of the file in the attachment store.
    #[serde(skip)]
    pub stored_name: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

impl Record for Attachment {
    const TABLE: Table<'static> = ATTACHMENTS;
    const ENTITY: &'static str = "attachment";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("owner_kind", self.owner.kind.to_string().into()),
            ("owner_id", self.owner.id.into()),
            ("file_name", self.file_name.as_str().into()),
            ("content_type", self.content_type.as_str().into()),
            ("size_bytes", self.size_bytes.into()),
            ("stored_name", self.stored_name.as_str().into()),
            ("uploaded_by", self.uploaded_by.as_str().into()),
            ("uploaded_at", self.uploaded_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            owner: Owner {
                kind: parse_column(row, "owner_kind")?,
                id: row.get("owner_id")?,
            },
            file_name: row.get("file_name")?,
            content_type: row.get("content_type")?,
            size_bytes: row.get("size_bytes")?,
            stored_name: row.get("stored_name")?,
            uploaded_by: row.get("uploaded_by")?,
            uploaded_at: row.get("uploaded_at")?,
        })
    }
}

/// A file to attach.
///
/// In JSON, `data` is the base64-encoded file contents.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewAttachment {
    pub file_name: String,
    pub content_type: String,
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

impl NewAttachment {
    pub fn validate(&self, store: &AttachmentStore) -> Problems {
        let mut problems = Problems::default();
        problems.check(!sanitize(&self.file_name).is_empty(), || {
            "file name is required".into()
        });
        problems.check(
            ALLOWED_CONTENT_TYPES.contains(&self.content_type.as_str()),
            || format!("content type {} is not allowed", self.content_type),
        );
        problems.check(!self.data.is_empty(), || "file is empty".into());
        problems.check(self.data.len() <= store.max_bytes(), || {
            format!(
                "file is {} bytes, more than the limit of {} bytes",
                self.data.len(),
                store.max_bytes()
            )
        });
        problems
    }
}

mod base64_data {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(|err| D::Error::custom(format!("invalid base64 data: {err}")))
    }
}

/// Strip path components and control characters from a client-supplied file name.
pub fn sanitize(file_name: &str) -> String {
    let base = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    base.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string()
}

/// File storage for attachment contents.
#[derive(Clone, Debug)]
pub struct AttachmentStore {
    root: PathBuf,
    max_bytes: usize,
}

impl AttachmentStore {
    /// Open a store rooted at `root`, creating the directory if necessary.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.context(StorageSnafu)?;
        Ok(Self { root, max_bytes })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Write a file, returning the name under which it was stored.
    ///
    /// The stored name is unique and keeps the extension of `file_name`.
    pub async fn save(&self, file_name: &str, data: &[u8]) -> Result<String> {
        let stored_name = match sanitize(file_name).rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
                format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase())
            }
            _ => Uuid::new_v4().to_string(),
        };
        fs::write(self.root.join(&stored_name), data)
            .await
            .context(StorageSnafu)?;
        tracing::debug!("stored {} bytes as {stored_name}", data.len());
        Ok(stored_name)
    }

    pub async fn read(&self, stored_name: &str) -> Result<Vec<u8>> {
        fs::read(self.root.join(stored_name))
            .await
            .context(StorageSnafu)
    }

    /// Remove a stored file. Removing a file which does not exist succeeds.
    pub async fn remove(&self, stored_name: &str) -> Result<()> {
        match fs::remove_file(self.root.join(stored_name)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err).context(StorageSnafu),
            _ => Ok(()),
        }
    }

    /// Remove stored files, logging rather than failing on errors.
    pub async fn remove_all<I>(&self, stored_names: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for name in stored_names {
            if let Err(err) = self.remove(name.as_ref()).await {
                tracing::error!("unable to remove attachment file {}: {err}", name.as_ref());
            }
        }
    }

    /// Write every file in `attachments`, returning their stored names in order.
    ///
    /// If any write fails, the files already written are removed again.
    pub async fn save_all(&self, attachments: &[NewAttachment]) -> Result<Vec<String>> {
        let mut stored = vec![];
        for attachment in attachments {
            match self.save(&attachment.file_name, &attachment.data).await {
                Ok(name) => stored.push(name),
                Err(err) => {
                    self.remove_all(&stored).await;
                    return Err(err);
                }
            }
        }
        Ok(stored)
    }

    /// Write the files of `attachments`, then run `insert` with their stored names.
    ///
    /// If `insert` fails, the files are removed again.
    pub async fn with_files<T, F, Fut>(&self, attachments: &[NewAttachment], insert: F) -> Result<T>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let stored = self.save_all(attachments).await?;
        match insert(stored.clone()).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.remove_all(&stored).await;
                Err(err)
            }
        }
    }
}

/// Insert attachment rows for files already written to the store.
///
/// `stored` holds the stored name of each attachment, as returned by
/// [`AttachmentStore::save_all`].
pub async fn insert_rows<E: Executor>(
    exec: &E,
    owner: Owner,
    attachments: &[NewAttachment],
    stored: &[String],
    user: &str,
) -> Result<Vec<i64>> {
    let now = Utc::now();
    let rows = attachments
        .iter()
        .zip(stored)
        .map(|(attachment, stored_name)| Attachment {
            id: 0,
            owner,
            file_name: sanitize(&attachment.file_name),
            content_type: attachment.content_type.clone(),
            size_bytes: attachment.data.len() as i64,
            stored_name: stored_name.clone(),
            uploaded_by: user.into(),
            uploaded_at: now,
        })
        .collect::<Vec<_>>();
    let ids = record::insert_all(exec, &rows).await?;
    for id in &ids {
        audit::record_create(exec, ATTACHMENTS.name, *id, user).await?;
    }
    Ok(ids)
}

/// Check that the owner of an attachment exists.
pub async fn check_owner<E: Executor>(exec: &E, owner: Owner) -> Result<()> {
    if record::exists(exec, owner.kind.table(), owner.id).await? {
        Ok(())
    } else {
        Err(Error::not_found(owner.kind.table().name, owner.id))
    }
}

/// Attach a file to an existing record.
pub async fn attach<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    owner: Owner,
    attachment: NewAttachment,
    user: &str,
) -> Result<Attachment> {
    attachment.validate(store).finish()?;
    check_owner(conn, owner).await?;

    let attachments = std::slice::from_ref(&attachment);
    let ids = store
        .with_files(attachments, |stored| {
            insert_checked(conn, owner, attachments, stored, user)
        })
        .await?;
    let id = ids.first().copied().ok_or_else(|| Error::Corrupt {
        message: "attachment insert returned no ID".into(),
    })?;
    get(conn, id).await
}

async fn insert_checked<C: Connection>(
    conn: &C,
    owner: Owner,
    attachments: &[NewAttachment],
    stored: Vec<String>,
    user: &str,
) -> Result<Vec<i64>> {
    atomically!(conn, |tx| {
        check_owner(&tx, owner).await?;
        insert_rows(&tx, owner, attachments, &stored, user).await
    })
}

pub async fn get<E: Executor>(exec: &E, id: i64) -> Result<Attachment> {
    record::fetch(exec, id).await
}

/// Metadata and contents of an attachment.
pub async fn download<E: Executor>(
    exec: &E,
    store: &AttachmentStore,
    id: i64,
) -> Result<(Attachment, Vec<u8>)> {
    let attachment = get(exec, id).await?;
    let data = store.read(&attachment.stored_name).await?;
    Ok((attachment, data))
}

/// All attachments of `owner`, oldest first.
pub async fn list_for<E: Executor>(exec: &E, owner: Owner) -> Result<Vec<Attachment>> {
    record::load_all(
        exec,
        Select::from(ATTACHMENTS.name)
            .filter("owner_kind", Op::Eq, owner.kind.to_string())
            .filter("owner_id", Op::Eq, owner.id)
            .order_by("id", Order::Asc),
    )
    .await
}

/// Delete an attachment and its stored file.
pub async fn delete<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    id: i64,
    user: &str,
) -> Result<()> {
    let attachment = atomically!(conn, |tx| {
        let attachment = get(&tx, id).await?;
        record::remove::<_, Attachment>(&tx, id).await?;
        audit::record_delete(&tx, ATTACHMENTS.name, id, user).await?;
        Ok(attachment)
    })?;
    store.remove(&attachment.stored_name).await
}

/// Delete the rows of every attachment of `owner`, returning their stored names.
///
/// The caller is responsible for removing the stored files once its transaction commits.
pub async fn remove_rows_for<E: Executor>(
    exec: &E,
    owner: Owner,
    user: &str,
) -> Result<Vec<String>> {
    let attachments = list_for(exec, owner).await?;
    for attachment in &attachments {
        record::remove::<_, Attachment>(exec, attachment.id).await?;
        audit::record_delete(exec, ATTACHMENTS.name, attachment.id, user).await?;
    }
    Ok(attachments.into_iter().map(|a| a.stored_name).collect())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        inspection::{self, test::new_inspection},
        sql::db::memory,
    };
    use std::env;

    /// A store in a fresh temporary directory.
    pub(crate) async fn temp_store() -> AttachmentStore {
        let dir = env::temp_dir().join(format!("qc-attachments-{}", Uuid::new_v4()));
        AttachmentStore::open(dir, 1024).await.unwrap()
    }

    pub(crate) fn pdf(name: &str) -> NewAttachment {
        NewAttachment {
            file_name: name.into(),
            content_type: "application/pdf".into(),
            data: b"%PDF-1.4 mill certificate".to_vec(),
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\certs\\heat 42.pdf"), "heat 42.pdf");
        assert_eq!(sanitize("..hidden"), "hidden");
        assert_eq!(sanitize("bad\nname.png"), "badname.png");
        assert_eq!(sanitize("dir/"), "");
    }

    #[test]
    fn test_base64_json() {
        let json = r#"{"file_name":"a.txt","content_type":"text/plain","data":"aGVsbG8="}"#;
        let attachment: NewAttachment = serde_json::from_str(json).unwrap();
        assert_eq!(attachment.data, b"hello");
        assert_eq!(serde_json::to_string(&attachment).unwrap(), json);

        let bad = r#"{"file_name":"a.txt","content_type":"text/plain","data":"!!"}"#;
        assert!(serde_json::from_str::<NewAttachment>(bad).is_err());
    }

    #[async_std::test]
    async fn test_validate() {
        let store = temp_store().await;
        assert!(pdf("cert.pdf").validate(&store).is_empty());

        let bad = NewAttachment {
            file_name: "/".into(),
            content_type: "application/x-msdownload".into(),
            data: vec![0; 2048],
        };
        let Err(Error::Invalid { problems }) = bad.validate(&store).finish() else {
            panic!("expected validation failure");
        };
        assert_eq!(problems.len(), 3);
    }

    #[async_std::test]
    async fn test_store_round_trip() {
        let store = temp_store().await;
        let name = store.save("Mill Cert.PDF", b"data").await.unwrap();
        assert!(name.ends_with(".pdf"));
        assert_eq!(store.read(&name).await.unwrap(), b"data");
        store.remove(&name).await.unwrap();
        assert!(store.read(&name).await.is_err());
        // Removing twice is fine.
        store.remove(&name).await.unwrap();
    }

    #[async_std::test]
    async fn test_attach_requires_owner() {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        let store = temp_store().await;

        let err = attach(
            &db,
            &store,
            Owner::new(OwnerKind::Inspection, 99),
            pdf("cert.pdf"),
            "alice",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { id: 99, .. }));
    }

    #[async_std::test]
    async fn test_attach_download_delete() {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        let store = temp_store().await;
        let inspection = inspection::create(&db, &store, new_inspection("Acme", vec![]), "alice")
            .await
            .unwrap()
            .inspection
            .id;
        let owner = Owner::new(OwnerKind::Inspection, inspection);
        let contents = pdf("cert.pdf").data;

        let attached = attach(&db, &store, owner, pdf("../certs/Mill Cert.pdf"), "bob")
            .await
            .unwrap();
        assert_eq!(attached.owner, owner);
        assert_eq!(attached.file_name, "Mill Cert.pdf");
        assert_eq!(attached.content_type, "application/pdf");
        assert_eq!(attached.size_bytes, contents.len() as i64);
        assert_eq!(attached.uploaded_by, "bob");
        assert_eq!(list_for(&db, owner).await.unwrap(), [attached.clone()]);

        let (meta, data) = download(&db, &store, attached.id).await.unwrap();
        assert_eq!(meta, attached);
        assert_eq!(data, contents);

        let history = audit::history(&db, ATTACHMENTS.name, attached.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, audit::Action::Create);

        delete(&db, &store, attached.id, "bob").await.unwrap();
        assert!(list_for(&db, owner).await.unwrap().is_empty());
        assert!(store.read(&attached.stored_name).await.is_err());
        assert!(matches!(
            get(&db, attached.id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_owner_kind_tables() {
        for kind in OwnerKind::iter() {
            assert_eq!(OwnerKind::from_table(kind.table().name), Some(kind));
        }
    }
}
