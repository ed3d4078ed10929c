use crate::error::{IoErrorContext, ProtocolError};
use crate::protocol::{ProtocolVersion, MAX_STRING_LIST_SIZE};
use crate::serialization::primitives::{
    read_bool, read_bytes, read_string, read_u64, write_bool, write_bytes, write_string, write_u64,
};
use crate::serialization::{Deserialize, Serialize};
use aulos_store_core::{
    BuildResult, BuildStatus, ContentAddress, Derivation, Hash, HashAlgo, Missing, StoreDir,
    StorePath, StorePathWithOutputs, SubstitutablePathInfo, ValidPathInfo,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::io::{AsyncRead, AsyncWrite};

impl Serialize for () {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        _writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl Serialize for u64 {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_u64(writer, *self).await
    }
}

impl Deserialize for u64 {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        read_u64(reader).await
    }
}

impl Serialize for bool {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_bool(writer, *self).await
    }
}

impl Deserialize for bool {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        read_bool(reader).await
    }
}

impl Serialize for Vec<u8> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_bytes(writer, self).await
    }
}

impl Deserialize for Vec<u8> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        read_bytes(reader).await
    }
}

impl Serialize for String {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_string(writer, self).await
    }
}

impl Deserialize for String {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        read_string(reader).await
    }
}

impl Serialize for StorePath {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_bytes(writer, store_dir.print_path(self)).await
    }
}

impl Deserialize for StorePath {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let bytes = read_bytes(reader).await?;
        store_dir.parse_path(&bytes).map_err(ProtocolError::decode)
    }
}

/// Optional store paths use the empty string for "none" on the wire.
impl Serialize for Option<StorePath> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        match self {
            Some(path) => path.serialize(writer, version, store_dir).await,
            None => write_bytes(writer, b"").await,
        }
    }
}

impl Deserialize for Option<StorePath> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let bytes = read_bytes(reader).await?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            store_dir
                .parse_path(&bytes)
                .map(Some)
                .map_err(ProtocolError::decode)
        }
    }
}

/// Same convention for optional content addresses.
impl Serialize for Option<ContentAddress> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_string(writer, &ContentAddress::render_opt(self.as_ref())).await
    }
}

impl Deserialize for Option<ContentAddress> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let bytes = read_bytes(reader).await?;
        ContentAddress::parse_opt(&bytes).map_err(ProtocolError::decode)
    }
}

fn check_list_len(len: u64) -> Result<(), ProtocolError> {
    if len > MAX_STRING_LIST_SIZE {
        Err(ProtocolError::StringListTooLong {
            length: len,
            max: MAX_STRING_LIST_SIZE,
        })
    } else {
        Ok(())
    }
}

impl<T: Serialize> Serialize for BTreeSet<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        check_list_len(self.len() as u64)?;
        write_u64(writer, self.len() as u64).await?;
        for item in self {
            item.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl<T: Deserialize + Ord> Deserialize for BTreeSet<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let len = read_u64(reader).await.io_context("reading set length")?;
        check_list_len(len)?;
        let mut result = BTreeSet::new();
        for _ in 0..len {
            result.insert(T::deserialize(reader, version, store_dir).await?);
        }
        Ok(result)
    }
}

impl<K: Serialize, V: Serialize> Serialize for BTreeMap<K, V> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        check_list_len(self.len() as u64)?;
        write_u64(writer, self.len() as u64).await?;
        for (key, value) in self {
            key.serialize(writer, version, store_dir).await?;
            value.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl<K: Deserialize + Ord, V: Deserialize> Deserialize for BTreeMap<K, V> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let len = read_u64(reader).await.io_context("reading map length")?;
        check_list_len(len)?;
        let mut result = BTreeMap::new();
        for _ in 0..len {
            let key = K::deserialize(reader, version, store_dir).await?;
            let value = V::deserialize(reader, version, store_dir).await?;
            result.insert(key, value);
        }
        Ok(result)
    }
}

impl Serialize for StorePathWithOutputs {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_bytes(writer, &self.to_wire_string()).await
    }
}

impl Deserialize for StorePathWithOutputs {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let bytes = read_bytes(reader).await?;
        StorePathWithOutputs::parse(store_dir, &bytes).map_err(ProtocolError::decode)
    }
}

/// The wire form of a derivation for `build_derivation`: only the basic
/// part travels; input derivations are the daemon's business.
impl Serialize for Derivation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_u64(writer, self.outputs.len() as u64).await?;
        for (name, output) in &self.outputs {
            write_string(writer, name).await?;
            output.path.serialize(writer, version, store_dir).await?;
            write_string(writer, &output.hash_algo).await?;
            write_string(writer, &output.hash).await?;
        }

        self.input_srcs.serialize(writer, version, store_dir).await?;
        write_bytes(writer, &self.platform).await?;
        write_bytes(writer, &self.builder).await?;

        write_u64(writer, self.args.len() as u64).await?;
        for arg in &self.args {
            write_bytes(writer, arg).await?;
        }

        write_u64(writer, self.env.len() as u64).await?;
        for (key, value) in &self.env {
            write_bytes(writer, key).await?;
            write_bytes(writer, value).await?;
        }
        Ok(())
    }
}

impl Deserialize for BuildResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let raw_status = read_u64(reader).await?;
        let status = BuildStatus::from_u64(raw_status)
            .ok_or_else(|| ProtocolError::Decode(format!("unknown build status {raw_status}")))?;
        let error_msg = read_string(reader).await?;
        Ok(BuildResult { status, error_msg })
    }
}

impl Deserialize for Missing {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let will_build = BTreeSet::deserialize(reader, version, store_dir).await?;
        let will_substitute = BTreeSet::deserialize(reader, version, store_dir).await?;
        let unknown = BTreeSet::deserialize(reader, version, store_dir).await?;
        let download_size = read_u64(reader).await?;
        let nar_size = read_u64(reader).await?;
        Ok(Missing {
            will_build,
            will_substitute,
            unknown,
            download_size,
            nar_size,
        })
    }
}

/// The `(deriver?, references, download_size, nar_size)` tail shared by
/// both encodings of substitutable-path info.
impl Deserialize for SubstitutablePathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let deriver = Option::<StorePath>::deserialize(reader, version, store_dir).await?;
        let references = BTreeSet::deserialize(reader, version, store_dir).await?;
        let download_size = read_u64(reader).await?;
        let nar_size = read_u64(reader).await?;
        Ok(SubstitutablePathInfo {
            deriver,
            references,
            download_size,
            nar_size,
        })
    }
}

/// Decode the path-info record that follows a `QueryPathInfo` or
/// `AddToStore` response. The path itself is not part of the record.
pub(crate) async fn read_valid_path_info<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: ProtocolVersion,
    store_dir: &StoreDir,
    path: StorePath,
) -> Result<ValidPathInfo, ProtocolError> {
    let deriver = Option::<StorePath>::deserialize(reader, version, store_dir).await?;
    let nar_hash_raw = read_bytes(reader).await?;
    let nar_hash =
        Hash::parse_any(&nar_hash_raw, Some(HashAlgo::Sha256)).map_err(ProtocolError::decode)?;
    let references = BTreeSet::deserialize(reader, version, store_dir).await?;
    let registration_time = read_u64(reader).await?;
    let nar_size = read_u64(reader).await?;

    let mut info = ValidPathInfo::new(path, nar_hash);
    info.deriver = deriver;
    info.references = references;
    info.registration_time = registration_time;
    info.nar_size = nar_size;

    if version.minor >= 16 {
        info.ultimate = read_bool(reader).await?;
        info.sigs = BTreeSet::deserialize(reader, version, store_dir).await?;
        info.ca = Option::<ContentAddress>::deserialize(reader, version, store_dir).await?;
    }

    Ok(info)
}

/// Encode the path-info record `AddToStoreNar` sends (minor >= 18). Unlike
/// the read side this always carries the minor-16 fields; daemons older
/// than 18 take the import envelope instead.
pub(crate) async fn write_nar_info_fields<W: AsyncWrite + Unpin>(
    writer: &mut W,
    version: ProtocolVersion,
    store_dir: &StoreDir,
    info: &ValidPathInfo,
) -> Result<(), ProtocolError> {
    info.deriver.serialize(writer, version, store_dir).await?;
    write_string(writer, &info.nar_hash.to_hex()).await?;
    info.references.serialize(writer, version, store_dir).await?;
    write_u64(writer, info.registration_time).await?;
    write_u64(writer, info.nar_size).await?;
    write_bool(writer, info.ultimate).await?;
    info.sigs.serialize(writer, version, store_dir).await?;
    info.ca.serialize(writer, version, store_dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    fn store_dir() -> StoreDir {
        StoreDir::default()
    }

    fn path(base: &str) -> StorePath {
        store_dir().make_path(base)
    }

    #[tokio::test]
    async fn store_path_sets_roundtrip() {
        let dir = store_dir();
        let mut paths = BTreeSet::new();
        paths.insert(path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo"));
        paths.insert(path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-bar-1.2"));

        let mut buf = Vec::new();
        paths
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();

        let mut cursor = Cursor::new(buf);
        let back = BTreeSet::<StorePath>::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert_eq!(back, paths);
    }

    #[tokio::test]
    async fn empty_path_set_roundtrips() {
        let dir = store_dir();
        let paths: BTreeSet<StorePath> = BTreeSet::new();
        let mut buf = Vec::new();
        paths
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert_eq!(buf.len(), 8);

        let mut cursor = Cursor::new(buf);
        let back = BTreeSet::<StorePath>::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert!(back.is_empty());
    }

    #[tokio::test]
    async fn wire_paths_are_validated() {
        let dir = store_dir();
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"/gnu/store/abc-evil").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            StorePath::deserialize(&mut cursor, PROTOCOL_VERSION, &dir).await,
            Err(ProtocolError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn path_ca_map_roundtrips() {
        let dir = store_dir();
        let ca = ContentAddress::parse(
            b"fixed:r:sha256:1b8e53ea4a4e0ee96ddf34585e6ca61b4b41cb152ae59e17b2e156b01b57f586",
        )
        .unwrap();
        let mut map: BTreeMap<StorePath, Option<ContentAddress>> = BTreeMap::new();
        map.insert(path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo"), Some(ca));
        map.insert(path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-bar"), None);

        let mut buf = Vec::new();
        map.serialize(&mut buf, PROTOCOL_VERSION, &dir).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let back = BTreeMap::<StorePath, Option<ContentAddress>>::deserialize(
            &mut cursor,
            PROTOCOL_VERSION,
            &dir,
        )
        .await
        .unwrap();
        assert_eq!(back, map);
    }

    #[tokio::test]
    async fn path_info_record_gates_on_minor_16() {
        let dir = store_dir();
        let target = path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo");

        let mut record = Vec::new();
        // deriver, nar hash, references, registration time, nar size
        write_bytes(&mut record, b"").await.unwrap();
        write_string(
            &mut record,
            "1b8e53ea4a4e0ee96ddf34585e6ca61b4b41cb152ae59e17b2e156b01b57f586",
        )
        .await
        .unwrap();
        write_u64(&mut record, 0).await.unwrap();
        write_u64(&mut record, 1700000000).await.unwrap();
        write_u64(&mut record, 4096).await.unwrap();

        let old = ProtocolVersion { major: 1, minor: 15 };
        let mut cursor = Cursor::new(record.clone());
        let info = read_valid_path_info(&mut cursor, old, &dir, target.clone())
            .await
            .unwrap();
        assert_eq!(info.nar_size, 4096);
        assert!(!info.ultimate);
        assert!(info.sigs.is_empty());

        // The same record with the minor-16 tail.
        write_bool(&mut record, true).await.unwrap();
        let mut sigs = BTreeSet::new();
        sigs.insert("cache.example.org-1:c2lnbmF0dXJl".to_string());
        sigs.serialize(&mut record, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        write_bytes(&mut record, b"").await.unwrap();

        let mut cursor = Cursor::new(record);
        let info = read_valid_path_info(&mut cursor, PROTOCOL_VERSION, &dir, target)
            .await
            .unwrap();
        assert!(info.ultimate);
        assert_eq!(info.sigs.len(), 1);
        assert_eq!(info.ca, None);
    }

    #[tokio::test]
    async fn oversized_list_is_rejected() {
        let dir = store_dir();
        let mut buf = Vec::new();
        write_u64(&mut buf, MAX_STRING_LIST_SIZE + 1).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            BTreeSet::<String>::deserialize(&mut cursor, PROTOCOL_VERSION, &dir).await,
            Err(ProtocolError::StringListTooLong { .. })
        ));
    }
}
