//! The store client: one method per daemon operation.
//!
//! Every operation follows the same shape: lease a connection, write the
//! opcode and arguments, drain interleaved stderr traffic, decode the
//! response. The per-operation code here is about the differences: which
//! encoding the negotiated protocol version wants, and what to fall back
//! to on daemons that predate an operation.

pub mod connection;
pub mod metrics;
pub mod pool;

use crate::error::{IoErrorContext, ProtocolError};
use crate::logger::{ActivityLogger, TracingLogger};
use crate::protocol::version::QUERY_OUTPUT_MAP_MINOR;
use crate::protocol::{OpCode, ProtocolVersion, EXPORT_MAGIC};
use crate::serialization::primitives::{
    read_bytes, read_u64, write_bool, write_bytes, write_string, write_u64,
};
use crate::serialization::store_types::{read_valid_path_info, write_nar_info_fields};
use crate::serialization::{Deserialize, Serialize};
use crate::settings::ClientSettings;
use aulos_store_core::{
    copy_nar, BuildMode, BuildResult, ContentAddress, ContentAddressMethod, Derivation,
    FileIngestionMethod, GcOptions, GcResults, HashAlgo, Missing, Roots, StoreDir, StorePath,
    StorePathWithOutputs, SubstitutablePathInfo, SubstitutablePathInfos, ValidPathInfo,
};
use pool::{ConnectionPool, PooledConnectionGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub use metrics::ClientMetrics;

/// How to reach the daemon: the configured default socket, or an explicit
/// `unix://` one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    Daemon,
    Unix(PathBuf),
}

impl StoreUri {
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if s == "daemon" {
            return Ok(StoreUri::Daemon);
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.starts_with('/') {
                return Ok(StoreUri::Unix(PathBuf::from(path)));
            }
        }
        Err(ProtocolError::InvalidUri(s.to_string()))
    }

    fn socket_path(&self, settings: &ClientSettings) -> PathBuf {
        match self {
            StoreUri::Daemon => settings.socket_path.clone(),
            StoreUri::Unix(path) => path.clone(),
        }
    }
}

impl std::fmt::Display for StoreUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreUri::Daemon => f.write_str("daemon"),
            StoreUri::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A handle on the daemon's store. Cheap to clone; all clones share one
/// connection pool and one path-info cache.
#[derive(Clone)]
pub struct DaemonStore {
    pool: ConnectionPool,
    settings: Arc<ClientSettings>,
    store_dir: StoreDir,
    uri: String,
    path_info_cache: Arc<Mutex<HashMap<StorePath, Arc<ValidPathInfo>>>>,
}

/// Apply the lease-release rule: a daemon-reported error leaves the wire
/// aligned and the connection reusable; any other failure means unread or
/// half-written bytes, so the connection is dropped.
fn release<T>(
    guard: PooledConnectionGuard,
    result: Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
    match &result {
        Err(e) if !e.keeps_connection() => guard.mark_broken(),
        _ => drop(guard),
    }
    result
}

fn is_broken_pipe(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::Io { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe
    )
}

impl DaemonStore {
    /// A store reachable over the configured default daemon socket,
    /// logging daemon output through `tracing`.
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_parts(StoreUri::Daemon, settings, Arc::new(TracingLogger), None)
    }

    /// Parse a store URI (`daemon` or `unix:///path`).
    pub fn from_uri(uri: &str, settings: ClientSettings) -> Result<Self, ProtocolError> {
        Ok(Self::with_parts(
            StoreUri::parse(uri)?,
            settings,
            Arc::new(TracingLogger),
            None,
        ))
    }

    /// Full constructor: URI, settings snapshot, daemon-log sink, and
    /// optional pool metrics.
    pub fn with_parts(
        uri: StoreUri,
        settings: ClientSettings,
        logger: Arc<dyn ActivityLogger>,
        client_metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let settings = Arc::new(settings);
        let socket_path = uri.socket_path(&settings);
        let uri = uri.to_string();
        let store_dir = settings.store_dir.clone();
        let pool = ConnectionPool::new(
            settings.clone(),
            socket_path,
            uri.clone(),
            logger,
            client_metrics,
        );
        Self {
            pool,
            settings,
            store_dir,
            uri,
            path_info_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    /// Open (or reuse) one connection and return it, verifying the daemon
    /// is reachable.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        let _guard = self.pool.get().await?;
        Ok(())
    }

    /// The protocol version negotiated with the daemon.
    pub async fn protocol_version(&self) -> Result<ProtocolVersion, ProtocolError> {
        Ok(self.pool.get().await?.version())
    }

    /// Drop idle connections that fail the health predicate.
    pub fn flush_bad_connections(&self) {
        self.pool.flush_bad();
    }

    /// `(idle, in_use, capacity)` of the connection pool.
    pub fn pool_stats(&self) -> (usize, usize, usize) {
        self.pool.stats()
    }

    // --- Queries ---------------------------------------------------------

    pub async fn is_valid_path(&self, path: &StorePath) -> Result<bool, ProtocolError> {
        self.simple_op(OpCode::IsValidPath, path).await
    }

    pub async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        {
            let mut guard = self.pool.get().await?;
            if guard.version().minor >= 12 {
                let result = self.run_op(&mut guard, OpCode::QueryValidPaths, paths).await;
                return release(guard, result);
            }
            // Old daemons answer one validity query at a time. The loop
            // below leases per query, so the lease must go first.
        }
        let mut valid = BTreeSet::new();
        for path in paths {
            if self.is_valid_path(path).await? {
                valid.insert(path.clone());
            }
        }
        Ok(valid)
    }

    pub async fn query_all_valid_paths(&self) -> Result<BTreeSet<StorePath>, ProtocolError> {
        self.simple_op(OpCode::QueryAllValidPaths, &()).await
    }

    pub async fn query_referrers(
        &self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        self.simple_op(OpCode::QueryReferrers, path).await
    }

    pub async fn query_valid_derivers(
        &self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        self.simple_op(OpCode::QueryValidDerivers, path).await
    }

    pub async fn query_substitutable_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        let mut guard = self.pool.get().await?;
        if guard.version().minor >= 12 {
            let result = self
                .run_op(&mut guard, OpCode::QuerySubstitutablePaths, paths)
                .await;
            return release(guard, result);
        }
        let result = self
            .query_substitutable_paths_legacy(&mut guard, paths)
            .await;
        release(guard, result)
    }

    /// Pre-1.12 fallback: one `HasSubstitutes` round trip per path, all on
    /// the held connection.
    async fn query_substitutable_paths_legacy(
        &self,
        guard: &mut PooledConnectionGuard,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        let mut result = BTreeSet::new();
        for path in paths {
            conn.send_opcode(OpCode::HasSubstitutes).await?;
            path.serialize(&mut conn.writer, version, &self.store_dir)
                .await?;
            conn.process_stderr().await?;
            if read_u64(&mut conn.reader).await? != 0 {
                result.insert(path.clone());
            }
        }
        Ok(result)
    }

    pub async fn query_substitutable_path_infos(
        &self,
        paths: &BTreeMap<StorePath, Option<ContentAddress>>,
    ) -> Result<SubstitutablePathInfos, ProtocolError> {
        if paths.is_empty() {
            return Ok(SubstitutablePathInfos::new());
        }
        let mut guard = self.pool.get().await?;
        let result = self
            .query_substitutable_path_infos_on(&mut guard, paths)
            .await;
        release(guard, result)
    }

    async fn query_substitutable_path_infos_on(
        &self,
        guard: &mut PooledConnectionGuard,
        paths: &BTreeMap<StorePath, Option<ContentAddress>>,
    ) -> Result<SubstitutablePathInfos, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        let mut infos = SubstitutablePathInfos::new();

        if version.minor < 12 {
            for path in paths.keys() {
                conn.send_opcode(OpCode::QuerySubstitutablePathInfo).await?;
                path.serialize(&mut conn.writer, version, &self.store_dir)
                    .await?;
                conn.process_stderr().await?;
                if read_u64(&mut conn.reader).await? == 0 {
                    continue;
                }
                let info =
                    SubstitutablePathInfo::deserialize(&mut conn.reader, version, &self.store_dir)
                        .await?;
                infos.insert(path.clone(), info);
            }
            return Ok(infos);
        }

        conn.send_opcode(OpCode::QuerySubstitutablePathInfos).await?;
        if version.minor < QUERY_OUTPUT_MAP_MINOR {
            let keys: BTreeSet<StorePath> = paths.keys().cloned().collect();
            keys.serialize(&mut conn.writer, version, &self.store_dir)
                .await?;
        } else {
            paths
                .serialize(&mut conn.writer, version, &self.store_dir)
                .await?;
        }
        conn.process_stderr().await?;

        let count = read_u64(&mut conn.reader).await?;
        for _ in 0..count {
            let path = StorePath::deserialize(&mut conn.reader, version, &self.store_dir).await?;
            let info =
                SubstitutablePathInfo::deserialize(&mut conn.reader, version, &self.store_dir)
                    .await?;
            infos.insert(path, info);
        }
        Ok(infos)
    }

    /// Cached path-info lookup. Invalid paths surface as
    /// [`ProtocolError::InvalidPath`] and are not cached.
    pub async fn query_path_info(
        &self,
        path: &StorePath,
    ) -> Result<Arc<ValidPathInfo>, ProtocolError> {
        if let Some(hit) = self.path_info_cache.lock().unwrap().get(path).cloned() {
            return Ok(hit);
        }
        let info = Arc::new(self.query_path_info_uncached(path).await?);
        self.path_info_cache
            .lock()
            .unwrap()
            .insert(path.clone(), info.clone());
        Ok(info)
    }

    pub async fn query_path_info_uncached(
        &self,
        path: &StorePath,
    ) -> Result<ValidPathInfo, ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.query_path_info_on(&mut guard, path).await;
        release(guard, result)
    }

    async fn query_path_info_on(
        &self,
        guard: &mut PooledConnectionGuard,
        path: &StorePath,
    ) -> Result<ValidPathInfo, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::QueryPathInfo).await?;
        path.serialize(&mut conn.writer, version, &self.store_dir)
            .await?;

        match conn.process_stderr().await {
            Ok(()) => {}
            // Daemons without the validity bit report invalid paths as a
            // plain error; the substring match is the only handle we have,
            // and it stays gated to those versions.
            Err(ProtocolError::Daemon { message, .. })
                if version.minor < 17 && message.contains("is not valid") =>
            {
                return Err(ProtocolError::InvalidPath {
                    path: path.to_string(),
                })
            }
            Err(e) => return Err(e),
        }

        if version.minor >= 17 {
            let valid = read_u64(&mut conn.reader).await? != 0;
            if !valid {
                return Err(ProtocolError::InvalidPath {
                    path: path.to_string(),
                });
            }
        }

        read_valid_path_info(&mut conn.reader, version, &self.store_dir, path.clone()).await
    }

    pub async fn query_path_from_hash_part(
        &self,
        hash_part: &str,
    ) -> Result<Option<StorePath>, ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.query_path_from_hash_part_on(&mut guard, hash_part).await;
        release(guard, result)
    }

    async fn query_path_from_hash_part_on(
        &self,
        guard: &mut PooledConnectionGuard,
        hash_part: &str,
    ) -> Result<Option<StorePath>, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::QueryPathFromHashPart).await?;
        write_string(&mut conn.writer, hash_part).await?;
        conn.process_stderr().await?;

        let raw = read_bytes(&mut conn.reader).await?;
        if raw.is_empty() {
            Ok(None)
        } else {
            self.store_dir
                .parse_path(&raw)
                .map(Some)
                .map_err(ProtocolError::decode)
        }
    }

    pub async fn query_derivation_outputs(
        &self,
        drv: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        {
            let mut guard = self.pool.get().await?;
            if guard.version().minor < QUERY_OUTPUT_MAP_MINOR {
                let result = self
                    .run_op(&mut guard, OpCode::QueryDerivationOutputs, drv)
                    .await;
                return release(guard, result);
            }
            // Newer daemons dropped this opcode; derive the answer from
            // the output map, which leases its own connection.
        }
        let map = self.query_partial_derivation_output_map(drv).await?;
        let mut outputs = BTreeSet::new();
        for (name, path) in map {
            match path {
                Some(path) => {
                    outputs.insert(path);
                }
                None => {
                    return Err(ProtocolError::UnknownOutputPath {
                        drv: drv.to_string(),
                        output: name,
                    })
                }
            }
        }
        Ok(outputs)
    }

    pub async fn query_partial_derivation_output_map(
        &self,
        drv: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>, ProtocolError> {
        {
            let mut guard = self.pool.get().await?;
            if guard.version().minor >= QUERY_OUTPUT_MAP_MINOR {
                let result = self
                    .run_op(&mut guard, OpCode::QueryDerivationOutputMap, drv)
                    .await;
                return release(guard, result);
            }
        }
        // Old daemons: read the recipe off disk. This under-approximates
        // for floating content-addressed outputs, which old stores cannot
        // hold anyway.
        let derivation = self.read_derivation(drv).await?;
        Ok(derivation.output_paths())
    }

    pub async fn query_missing(
        &self,
        targets: &[StorePathWithOutputs],
    ) -> Result<Missing, ProtocolError> {
        {
            let mut guard = self.pool.get().await?;
            if guard.version().minor >= 19 {
                let result = self.query_missing_on(&mut guard, targets).await;
                return release(guard, result);
            }
            // The fallback issues store queries of its own, each leasing a
            // connection; holding this lease across it would deadlock a
            // single-slot pool.
        }
        self.query_missing_fallback(targets).await
    }

    async fn query_missing_on(
        &self,
        guard: &mut PooledConnectionGuard,
        targets: &[StorePathWithOutputs],
    ) -> Result<Missing, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::QueryMissing).await?;
        write_u64(&mut conn.writer, targets.len() as u64).await?;
        for target in targets {
            target
                .serialize(&mut conn.writer, version, &self.store_dir)
                .await?;
        }
        conn.process_stderr().await?;
        Missing::deserialize(&mut conn.reader, version, &self.store_dir).await
    }

    /// Compute the missing set client-side for daemons without
    /// `QueryMissing`: walk the targets, classify each path as valid,
    /// substitutable or unknown, and recurse into the inputs of anything
    /// that has to be built.
    async fn query_missing_fallback(
        &self,
        targets: &[StorePathWithOutputs],
    ) -> Result<Missing, ProtocolError> {
        let mut missing = Missing::default();
        let mut done: BTreeSet<StorePath> = BTreeSet::new();
        let mut queue: VecDeque<StorePathWithOutputs> = targets.iter().cloned().collect();

        while let Some(target) = queue.pop_front() {
            if !done.insert(target.path.clone()) {
                continue;
            }

            if !target.path.is_derivation() {
                if self.is_valid_path(&target.path).await? {
                    continue;
                }
                let query = BTreeMap::from([(target.path.clone(), None)]);
                match self.query_substitutable_path_infos(&query).await?.remove(&target.path) {
                    Some(info) => {
                        missing.will_substitute.insert(target.path);
                        missing.download_size += info.download_size;
                        missing.nar_size += info.nar_size;
                    }
                    None => {
                        missing.unknown.insert(target.path);
                    }
                }
                continue;
            }

            if !self.is_valid_path(&target.path).await? {
                missing.unknown.insert(target.path);
                continue;
            }

            let drv = self.read_derivation(&target.path).await?;
            let mut invalid = Vec::new();
            for (name, out_path) in drv.output_paths() {
                if !target.outputs.is_empty() && !target.outputs.contains(&name) {
                    continue;
                }
                if let Some(out_path) = out_path {
                    if !self.is_valid_path(&out_path).await? {
                        invalid.push(out_path);
                    }
                }
            }
            if invalid.is_empty() {
                continue;
            }

            let mut must_build = false;
            if self.settings.use_substitutes {
                let query: BTreeMap<StorePath, Option<ContentAddress>> =
                    invalid.iter().map(|p| (p.clone(), None)).collect();
                let substitutable = self.query_substitutable_path_infos(&query).await?;
                for out_path in &invalid {
                    match substitutable.get(out_path) {
                        Some(info) => {
                            missing.will_substitute.insert(out_path.clone());
                            missing.download_size += info.download_size;
                            missing.nar_size += info.nar_size;
                        }
                        None => must_build = true,
                    }
                }
            } else {
                must_build = true;
            }

            if must_build {
                missing.will_build.insert(target.path.clone());
                for (input_drv, outs) in &drv.input_drvs {
                    queue.push_back(StorePathWithOutputs::new(
                        input_drv.clone(),
                        outs.iter().cloned(),
                    ));
                }
                for src in &drv.input_srcs {
                    queue.push_back(StorePathWithOutputs::opaque(src.clone()));
                }
            }
        }

        Ok(missing)
    }

    // --- Additions -------------------------------------------------------

    /// Add content-addressed data. On modern daemons the payload streams
    /// through the framed sink; older daemons take the per-method legacy
    /// encodings.
    pub async fn add_ca_to_store<R>(
        &self,
        source: &mut R,
        name: &str,
        method: ContentAddressMethod,
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<ValidPathInfo, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut guard = self.pool.get().await?;
        let version = guard.version();

        if version.minor >= 25 {
            let result = self
                .add_ca_modern(&mut guard, source, name, method, references, repair)
                .await;
            return release(guard, result);
        }

        if repair {
            drop(guard);
            return Err(ProtocolError::UnsupportedOperation {
                operation: "repair",
                reason: "repairing additions needs daemon protocol >= 1.25".to_string(),
            });
        }

        let path = match self
            .add_ca_legacy(&mut guard, source, name, method, references)
            .await
        {
            Ok(path) => {
                // Release before the info query below: it leases its own
                // connection, and the pool may have a single slot.
                drop(guard);
                path
            }
            Err(e) => return release(guard, Err(e)),
        };

        let info = self.query_path_info(&path).await?;
        Ok((*info).clone())
    }

    async fn add_ca_modern<R>(
        &self,
        guard: &mut PooledConnectionGuard,
        source: &mut R,
        name: &str,
        method: ContentAddressMethod,
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<ValidPathInfo, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::AddToStore).await?;
        write_string(&mut conn.writer, name).await?;
        write_string(&mut conn.writer, &method.render()).await?;
        references
            .serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        write_bool(&mut conn.writer, repair).await?;

        conn.with_framed_source(source).await?;

        let path = StorePath::deserialize(&mut conn.reader, version, &self.store_dir).await?;
        read_valid_path_info(&mut conn.reader, version, &self.store_dir, path).await
    }

    async fn add_ca_legacy<R>(
        &self,
        guard: &mut PooledConnectionGuard,
        source: &mut R,
        name: &str,
        method: ContentAddressMethod,
        references: &BTreeSet<StorePath>,
    ) -> Result<StorePath, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let version = guard.version();
        match method {
            ContentAddressMethod::Text => {
                let mut contents = Vec::new();
                source
                    .read_to_end(&mut contents)
                    .await
                    .io_context("reading text payload")?;

                let conn = guard.connection();
                conn.send_opcode(OpCode::AddTextToStore).await?;
                write_string(&mut conn.writer, name).await?;
                write_bytes(&mut conn.writer, &contents).await?;
                references
                    .serialize(&mut conn.writer, version, &self.store_dir)
                    .await?;
                conn.process_stderr().await?;
                StorePath::deserialize(&mut conn.reader, version, &self.store_dir).await
            }

            ContentAddressMethod::Fixed { method, algo } => {
                {
                    let conn = guard.connection();
                    conn.send_opcode(OpCode::AddToStore).await?;
                    write_string(&mut conn.writer, name).await?;
                    // The flag pair predates content-address strings:
                    // "fixed" is cleared only for plain recursive SHA-256.
                    let plain = algo == HashAlgo::Sha256 && method.is_recursive();
                    write_bool(&mut conn.writer, !plain).await?;
                    write_bool(&mut conn.writer, method.is_recursive()).await?;
                    write_string(&mut conn.writer, algo.name()).await?;
                }

                // Whatever produces the payload may itself lease a
                // connection; widen the pool while we stream.
                self.pool.inc_capacity();
                let sent = self.send_legacy_dump(guard, source, method).await;
                self.pool.dec_capacity();

                if let Err(e) = sent {
                    if is_broken_pipe(&e) {
                        // The daemon hung up mid-upload; give it one chance
                        // to say why before surfacing the pipe error.
                        if let Err(daemon_err @ ProtocolError::Daemon { .. }) =
                            guard.connection().process_stderr().await
                        {
                            return Err(daemon_err);
                        }
                    }
                    return Err(e);
                }

                let conn = guard.connection();
                conn.process_stderr().await?;
                StorePath::deserialize(&mut conn.reader, version, &self.store_dir).await
            }
        }
    }

    async fn send_legacy_dump<R>(
        &self,
        guard: &mut PooledConnectionGuard,
        source: &mut R,
        method: FileIngestionMethod,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let conn = guard.connection();
        match method {
            // Recursive ingestion sends the caller's NAR bytes as-is.
            FileIngestionMethod::Recursive => {
                tokio::io::copy(source, &mut conn.writer)
                    .await
                    .io_context("sending NAR payload")?;
            }
            // Flat ingestion wraps the bytes in a single-file NAR.
            FileIngestionMethod::Flat => {
                let mut contents = Vec::new();
                source
                    .read_to_end(&mut contents)
                    .await
                    .io_context("reading payload")?;
                aulos_store_core::nar::dump_string(&contents, &mut conn.writer)
                    .await
                    .io_context("sending payload")?;
            }
        }
        Ok(())
    }

    /// Add a store object with known metadata plus its NAR serialization.
    pub async fn add_to_store_nar<R>(
        &self,
        info: &ValidPathInfo,
        source: &mut R,
        repair: bool,
        check_sigs: bool,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut guard = self.pool.get().await?;
        let result = self
            .add_to_store_nar_on(&mut guard, info, source, repair, check_sigs)
            .await;
        release(guard, result)
    }

    async fn add_to_store_nar_on<R>(
        &self,
        guard: &mut PooledConnectionGuard,
        info: &ValidPathInfo,
        source: &mut R,
        repair: bool,
        check_sigs: bool,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let version = guard.version();
        if version.minor < 18 {
            return self.import_path_legacy(guard, info, source).await;
        }

        let conn = guard.connection();
        conn.send_opcode(OpCode::AddToStoreNar).await?;
        info.path
            .serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        write_nar_info_fields(&mut conn.writer, version, &self.store_dir, info).await?;
        write_bool(&mut conn.writer, repair).await?;
        write_bool(&mut conn.writer, !check_sigs).await?;

        if version.minor >= 23 {
            // Framed payload with a concurrent stderr drain.
            conn.with_framed_source(source).await
        } else if version.minor >= 21 {
            // The daemon pulls the NAR through stderr READ requests.
            conn.process_stderr_with(None::<&mut tokio::io::Sink>, Some(source))
                .await
        } else {
            // Unframed: the daemon parses the NAR to find its end, and so
            // do we.
            copy_nar(source, &mut conn.writer).await?;
            conn.process_stderr().await
        }
    }

    /// Pre-1.18 upload: wrap the NAR in the old export envelope and feed
    /// it through `ImportPaths`.
    async fn import_path_legacy<R>(
        &self,
        guard: &mut PooledConnectionGuard,
        info: &ValidPathInfo,
        source: &mut R,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let version = guard.version();

        let mut prefix = Vec::new();
        write_u64(&mut prefix, 1).await?; // a path follows
        let mut suffix = Vec::new();
        write_u64(&mut suffix, EXPORT_MAGIC).await?;
        info.path
            .serialize(&mut suffix, version, &self.store_dir)
            .await?;
        info.references
            .serialize(&mut suffix, version, &self.store_dir)
            .await?;
        info.deriver
            .serialize(&mut suffix, version, &self.store_dir)
            .await?;
        write_u64(&mut suffix, 0).await?; // no legacy signature
        write_u64(&mut suffix, 0).await?; // no more paths

        let conn = guard.connection();
        conn.send_opcode(OpCode::ImportPaths).await?;
        let mut envelope = prefix.as_slice().chain(&mut *source).chain(suffix.as_slice());
        conn.process_stderr_with(None::<&mut tokio::io::Sink>, Some(&mut envelope))
            .await?;

        // The daemon echoes the imported path set.
        let _imported =
            BTreeSet::<StorePath>::deserialize(&mut conn.reader, version, &self.store_dir).await?;
        Ok(())
    }

    pub async fn add_to_store_from_dump<R>(
        &self,
        source: &mut R,
        name: &str,
        method: FileIngestionMethod,
        algo: HashAlgo,
        repair: bool,
    ) -> Result<StorePath, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let info = self
            .add_ca_to_store(
                source,
                name,
                ContentAddressMethod::Fixed { method, algo },
                &BTreeSet::new(),
                repair,
            )
            .await?;
        Ok(info.path)
    }

    pub async fn add_text_to_store(
        &self,
        name: &str,
        contents: &[u8],
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<StorePath, ProtocolError> {
        let mut source = contents;
        let info = self
            .add_ca_to_store(
                &mut source,
                name,
                ContentAddressMethod::Text,
                references,
                repair,
            )
            .await?;
        Ok(info.path)
    }

    pub async fn add_signatures(
        &self,
        path: &StorePath,
        sigs: &BTreeSet<String>,
    ) -> Result<(), ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.add_signatures_on(&mut guard, path, sigs).await;
        release(guard, result)
    }

    async fn add_signatures_on(
        &self,
        guard: &mut PooledConnectionGuard,
        path: &StorePath,
        sigs: &BTreeSet<String>,
    ) -> Result<(), ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::AddSignatures).await?;
        path.serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        sigs.serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        conn.process_stderr().await?;
        read_u64(&mut conn.reader).await?;
        Ok(())
    }

    // --- Building --------------------------------------------------------

    pub async fn build_paths(
        &self,
        targets: &[StorePathWithOutputs],
        mode: BuildMode,
    ) -> Result<(), ProtocolError> {
        let mut guard = self.pool.get().await?;
        let version = guard.version();
        if version.minor < 13 {
            drop(guard);
            return Err(ProtocolError::UnsupportedOperation {
                operation: "build_paths",
                reason: format!("daemon protocol {version} cannot build on request"),
            });
        }
        if version.minor < 15 && mode != BuildMode::Normal {
            // Old daemons take no build mode; anything but a normal build
            // would silently degrade, so refuse client-side.
            drop(guard);
            return Err(ProtocolError::UnsupportedOperation {
                operation: "build_paths",
                reason: "repairing or checking needs daemon protocol >= 1.15".to_string(),
            });
        }
        let result = self.build_paths_on(&mut guard, targets, mode).await;
        release(guard, result)
    }

    async fn build_paths_on(
        &self,
        guard: &mut PooledConnectionGuard,
        targets: &[StorePathWithOutputs],
        mode: BuildMode,
    ) -> Result<(), ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::BuildPaths).await?;
        write_u64(&mut conn.writer, targets.len() as u64).await?;
        for target in targets {
            target
                .serialize(&mut conn.writer, version, &self.store_dir)
                .await?;
        }
        if version.minor >= 15 {
            write_u64(&mut conn.writer, mode as u64).await?;
        }
        conn.process_stderr().await?;
        read_u64(&mut conn.reader).await?;
        Ok(())
    }

    pub async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &Derivation,
        mode: BuildMode,
    ) -> Result<BuildResult, ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.build_derivation_on(&mut guard, drv_path, drv, mode).await;
        release(guard, result)
    }

    async fn build_derivation_on(
        &self,
        guard: &mut PooledConnectionGuard,
        drv_path: &StorePath,
        drv: &Derivation,
        mode: BuildMode,
    ) -> Result<BuildResult, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::BuildDerivation).await?;
        drv_path
            .serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        drv.serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        write_u64(&mut conn.writer, mode as u64).await?;
        conn.process_stderr().await?;
        BuildResult::deserialize(&mut conn.reader, version, &self.store_dir).await
    }

    pub async fn ensure_path(&self, path: &StorePath) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_op(OpCode::EnsurePath, path).await?;
        Ok(())
    }

    // --- Roots and garbage collection ------------------------------------

    pub async fn add_temp_root(&self, path: &StorePath) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_op(OpCode::AddTempRoot, path).await?;
        Ok(())
    }

    pub async fn add_indirect_root(&self, path: &Path) -> Result<(), ProtocolError> {
        use std::os::unix::ffi::OsStrExt;
        let raw = path.as_os_str().as_bytes().to_vec();
        let _: u64 = self.simple_op(OpCode::AddIndirectRoot, &raw).await?;
        Ok(())
    }

    pub async fn sync_with_gc(&self) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_op(OpCode::SyncWithGC, &()).await?;
        Ok(())
    }

    pub async fn find_roots(&self) -> Result<Roots, ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.find_roots_on(&mut guard).await;
        release(guard, result)
    }

    async fn find_roots_on(
        &self,
        guard: &mut PooledConnectionGuard,
    ) -> Result<Roots, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::FindRoots).await?;
        conn.process_stderr().await?;

        let count = read_u64(&mut conn.reader).await?;
        let mut roots = Roots::new();
        for _ in 0..count {
            let link = String::from_utf8_lossy(&read_bytes(&mut conn.reader).await?).into_owned();
            let target = StorePath::deserialize(&mut conn.reader, version, &self.store_dir).await?;
            roots.entry(target).or_default().insert(link);
        }
        Ok(roots)
    }

    pub async fn collect_garbage(&self, options: &GcOptions) -> Result<GcResults, ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.collect_garbage_on(&mut guard, options).await;
        let result = release(guard, result);
        if result.is_ok() {
            // Whatever was cached may be gone now.
            self.path_info_cache.lock().unwrap().clear();
        }
        result
    }

    async fn collect_garbage_on(
        &self,
        guard: &mut PooledConnectionGuard,
        options: &GcOptions,
    ) -> Result<GcResults, ProtocolError> {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::CollectGarbage).await?;
        write_u64(&mut conn.writer, options.action as u64).await?;
        options
            .paths_to_delete
            .serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        write_bool(&mut conn.writer, options.ignore_liveness).await?;
        write_u64(&mut conn.writer, options.max_freed).await?;
        // Removed options.
        write_u64(&mut conn.writer, 0).await?;
        write_u64(&mut conn.writer, 0).await?;
        write_u64(&mut conn.writer, 0).await?;

        conn.process_stderr().await?;

        let count = read_u64(&mut conn.reader).await?;
        let mut paths = BTreeSet::new();
        for _ in 0..count {
            paths.insert(
                String::from_utf8_lossy(&read_bytes(&mut conn.reader).await?).into_owned(),
            );
        }
        let bytes_freed = read_u64(&mut conn.reader).await?;
        let _obsolete = read_u64(&mut conn.reader).await?;

        Ok(GcResults { paths, bytes_freed })
    }

    // --- Maintenance -----------------------------------------------------

    pub async fn optimise_store(&self) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_op(OpCode::OptimiseStore, &()).await?;
        Ok(())
    }

    pub async fn verify_store(
        &self,
        check_contents: bool,
        repair: bool,
    ) -> Result<bool, ProtocolError> {
        let mut guard = self.pool.get().await?;
        let result = self.verify_store_on(&mut guard, check_contents, repair).await;
        release(guard, result)
    }

    async fn verify_store_on(
        &self,
        guard: &mut PooledConnectionGuard,
        check_contents: bool,
        repair: bool,
    ) -> Result<bool, ProtocolError> {
        let conn = guard.connection();
        conn.send_opcode(OpCode::VerifyStore).await?;
        write_bool(&mut conn.writer, check_contents).await?;
        write_bool(&mut conn.writer, repair).await?;
        conn.process_stderr().await?;
        Ok(read_u64(&mut conn.reader).await? != 0)
    }

    /// Stream the NAR serialization of a path into `sink`.
    pub async fn nar_from_path<W>(
        &self,
        path: &StorePath,
        sink: &mut W,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut guard = self.pool.get().await?;
        let result = self.nar_from_path_on(&mut guard, path, sink).await;
        release(guard, result)
    }

    async fn nar_from_path_on<W>(
        &self,
        guard: &mut PooledConnectionGuard,
        path: &StorePath,
        sink: &mut W,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(OpCode::NarFromPath).await?;
        path.serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        conn.process_stderr().await?;
        // The NAR is unframed; parse it to know where it ends.
        copy_nar(&mut conn.reader, sink).await?;
        Ok(())
    }

    // --- Shared plumbing -------------------------------------------------

    async fn read_derivation(&self, drv: &StorePath) -> Result<Derivation, ProtocolError> {
        let bytes = tokio::fs::read(drv.as_fs_path())
            .await
            .io_context(format!("reading derivation '{drv}'"))?;
        Derivation::parse(&self.store_dir, &bytes).map_err(ProtocolError::decode)
    }

    /// Lease, send one opcode plus one encoded request, drain stderr,
    /// decode one response, release.
    async fn simple_op<Req, Resp>(&self, opcode: OpCode, request: &Req) -> Result<Resp, ProtocolError>
    where
        Req: Serialize + ?Sized,
        Resp: Deserialize,
    {
        let mut guard = self.pool.get().await?;
        let result = self.run_op(&mut guard, opcode, request).await;
        release(guard, result)
    }

    async fn run_op<Req, Resp>(
        &self,
        guard: &mut PooledConnectionGuard,
        opcode: OpCode,
        request: &Req,
    ) -> Result<Resp, ProtocolError>
    where
        Req: Serialize + ?Sized,
        Resp: Deserialize,
    {
        let version = guard.version();
        let conn = guard.connection();
        conn.send_opcode(opcode).await?;
        request
            .serialize(&mut conn.writer, version, &self.store_dir)
            .await?;
        conn.process_stderr().await?;
        Resp::deserialize(&mut conn.reader, version, &self.store_dir).await
    }
}
