//! Streaming manifest reader.
//!
//! The `data` array is visited one [`ColumnFamilyResult`] at a time; the
//! whole document is never held in memory.

use crate::manifest::{parse_meta_file_name, ColumnFamilyResult, MetaFileInfo};
use crate::utils::errors::{BackupError, Result};
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserializer;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Read a V2 manifest, calling `on_column_family` for every table it lists.
///
/// Files not named `meta_v2_<yyyyMMddHHmm>.json` are rejected, which also
/// rejects the temporary file of an unfinished write.
pub fn read_meta_file<F>(path: &Path, mut on_column_family: F) -> Result<MetaFileInfo>
where
    F: FnMut(ColumnFamilyResult),
{
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if parse_meta_file_name(&file_name).is_none() {
        return Err(BackupError::InvalidMetaFile(format!(
            "{} is not a manifest file name",
            path.display()
        )));
    }

    let reader = BufReader::new(File::open(path)?);
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let info = MetaDocument {
        on_column_family: &mut on_column_family,
    }
    .deserialize(&mut deserializer)
    .map_err(|e| BackupError::InvalidMetaFile(format!("{}: {}", path.display(), e)))?;
    deserializer
        .end()
        .map_err(|e| BackupError::InvalidMetaFile(format!("{}: {}", path.display(), e)))?;
    Ok(info)
}

struct MetaDocument<'f, F> {
    on_column_family: &'f mut F,
}

impl<'de, F> DeserializeSeed<'de> for MetaDocument<'_, F>
where
    F: FnMut(ColumnFamilyResult),
{
    type Value = MetaFileInfo;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, F> Visitor<'de> for MetaDocument<'_, F>
where
    F: FnMut(ColumnFamilyResult),
{
    type Value = MetaFileInfo;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a manifest object with info and data")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let on_column_family = self.on_column_family;
        let mut info = None;
        let mut saw_data = false;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "info" => info = Some(map.next_value::<MetaFileInfo>()?),
                "data" => {
                    map.next_value_seed(DataArray {
                        on_column_family: &mut *on_column_family,
                    })?;
                    saw_data = true;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        if !saw_data {
            return Err(de::Error::missing_field("data"));
        }
        info.ok_or_else(|| de::Error::missing_field("info"))
    }
}

struct DataArray<'f, F> {
    on_column_family: &'f mut F,
}

impl<'de, F> DeserializeSeed<'de> for DataArray<'_, F>
where
    F: FnMut(ColumnFamilyResult),
{
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, F> Visitor<'de> for DataArray<'_, F>
where
    F: FnMut(ColumnFamilyResult),
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of column family results")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(mut cf) = seq.next_element::<ColumnFamilyResult>()? {
            cf.fill_component_owners();
            (self.on_column_family)(cf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "info": {"version": 1, "appName": "cass_test", "region": "us-east-1",
                 "rack": "rack1", "backupIdentifier": ["1808575600"]},
        "extra": {"ignored": true},
        "data": [
            {"keyspaceName": "ks1", "columnfamilyName": "cf1", "sstables": [
                {"prefix": "mc-1-big", "sstableComponents": [
                    {"file": "mc-1-big-Index.db", "modify": 1672531200000, "creation": 1672531200000,
                     "size": 10, "compression": "NONE", "uploaded": true, "loc": "k/mc-1-big-Index.db"},
                    {"file": "mc-1-big-Data.db", "modify": 1672531200000, "creation": 1672531200000,
                     "size": 20, "compression": "SNAPPY", "uploaded": false}
                ]}
            ]}
        ]
    }"#;

    #[test]
    fn test_reads_sample_document() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("meta_v2_202301010000.json");
        std::fs::write(&path, SAMPLE)?;

        let mut seen = Vec::new();
        let info = read_meta_file(&path, |cf| seen.push(cf))?;
        assert_eq!(info.app_name, "cass_test");
        assert_eq!(info.backup_identifier, vec!["1808575600"]);
        assert_eq!(seen.len(), 1);

        let components: Vec<_> = seen[0].components().collect();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].keyspace, "ks1");
        assert_eq!(components[0].backup_path.as_deref(), Some("k/mc-1-big-Index.db"));
        assert_eq!(components[1].backup_path, None);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_file_names() -> Result<()> {
        let temp_dir = TempDir::new()?;
        for name in ["meta_v2_202301010000.json.tmp", "meta.json", "meta_v2_bad.json"] {
            let path = temp_dir.path().join(name);
            std::fs::write(&path, SAMPLE)?;
            assert!(matches!(
                read_meta_file(&path, |_| {}),
                Err(BackupError::InvalidMetaFile(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_rejects_truncated_document() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("meta_v2_202301010000.json");
        std::fs::write(&path, &SAMPLE[..SAMPLE.len() / 2])?;
        assert!(read_meta_file(&path, |_| {}).is_err());

        std::fs::write(&path, r#"{"data": []}"#)?;
        assert!(read_meta_file(&path, |_| {}).is_err());
        Ok(())
    }
}
