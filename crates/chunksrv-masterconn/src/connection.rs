use crate::outbound::OutputQueue;
use crate::registration::{select_registration_version, RegistrationVersion};
use crate::state::ConnectionState;
use crate::structlog::ChangelogSink;
use chunksrv_core::collaborators::{ChunkOpKind, ChunkOpRequest, HddStore, Replicator};
use chunksrv_core::config::ChunkServerConfig;
use chunksrv_core::error::MasterConnError;
use chunksrv_core::version::ProtocolVersion;
use chunksrv_jobs::{JobPool, JobResult};
use chunksrv_proto::types::{chunk_op_status_msg_type, id, RegisterPayload};
use chunksrv_proto::{ChunkServerReply, DecodeError, Frame, FrameDecoder, FrameError, MasterCommand, StructureLogEntry};
use log::warn;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn nop_frame() -> Frame {
    Frame {
        msg_type: id::ANTOAN_NOP,
        body: Vec::new(),
    }
}

/// Size of a `CSTOAN_CHUNK_CHECKSUM_TAB` reply's checksum block, matching
/// the original's `MAXCHECKSUMCHUNKS*4 == 4096`-byte `CRC` array.
const CHECKSUM_TAB_SIZE: usize = 4096;

fn decode_error_to_masterconn(frame_type: u32, e: DecodeError) -> MasterConnError {
    match e {
        DecodeError::UnknownCommand(t) => MasterConnError::UnknownCommand { command_type: t },
        DecodeError::BadLength {
            command_type,
            expected,
            actual,
        } => MasterConnError::BadBodyLength {
            command_type,
            expected,
            actual,
        },
        DecodeError::Body(_) | DecodeError::StructureLog(_) => MasterConnError::BadBodyLength {
            command_type: frame_type,
            expected: 0,
            actual: 0,
        },
    }
}

/// The Master-Connection Protocol Engine: owns one long-lived connection
/// to the metadata master, the frame decoder reassembling its byte
/// stream, the output queue its write loop drains, and the background
/// job pool command handlers submit to. Generic over the transport `S`
/// so tests can drive it with a plain loopback `TcpStream` while the
/// daemon wires it to a non-blocking `mio::net::TcpStream`.
pub struct MasterConnection<S, H, R> {
    stream: Option<S>,
    decoder: FrameDecoder,
    pending_write: Vec<u8>,
    output: Arc<OutputQueue>,
    jobs: Arc<JobPool<H, R>>,
    changelog: ChangelogSink,
    config: ChunkServerConfig,
    state: ConnectionState,
    last_activity: Instant,
    last_write: Instant,
    last_register: Option<Instant>,
}

impl<S, H, R> MasterConnection<S, H, R>
where
    S: Read + Write,
    H: HddStore + 'static,
    R: Replicator + 'static,
{
    pub fn new(jobs: Arc<JobPool<H, R>>, changelog: ChangelogSink, config: ChunkServerConfig) -> Self {
        Self {
            stream: None,
            decoder: FrameDecoder::new(),
            pending_write: Vec::new(),
            output: Arc::new(OutputQueue::new()),
            jobs,
            changelog,
            config,
            state: ConnectionState::Free,
            last_activity: Instant::now(),
            last_write: Instant::now(),
            last_register: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Adopts an already-connected stream (the daemon performs the actual
    /// non-blocking `connect()`/DNS resolution; this just marks the
    /// engine's state and queues the registration packet).
    pub fn attach_stream(&mut self, stream: S) {
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.last_activity = Instant::now();
        self.last_write = Instant::now();
        self.queue_registration();
    }

    pub fn kill(&mut self) {
        self.stream = None;
        self.pending_write.clear();
        self.decoder = FrameDecoder::new();
        self.state = ConnectionState::Kill;
        metrics::counter!("chunksrv_masterconn_kill_total").increment(1);
    }

    /// Resets from `Kill` back to `Free` so a fresh connection attempt
    /// can be made after `master_reconnection_delay`.
    pub fn reset_to_free(&mut self) {
        self.state = ConnectionState::Free;
    }

    fn registration_payload(&self) -> RegisterPayload {
        let summary = self.jobs.hdd().chunk_list_summary();
        RegisterPayload {
            my_ip: self.config.bind_ip,
            my_port: self.config.bind_port,
            used_space: summary.used_space,
            total_space: summary.total_space,
            to_delete_used_space: summary.to_delete_used_space,
            to_delete_total_space: summary.to_delete_total_space,
            to_delete_chunk_count: summary.to_delete_chunk_count,
            chunks: self.jobs.hdd().enumerate_chunks(),
        }
    }

    fn queue_registration(&mut self) {
        let now = Instant::now();
        let timeout = self.config.clamped_master_timeout();
        let version = select_registration_version(self.last_register, now, timeout);
        let payload = self.registration_payload();
        let reply = match version {
            RegistrationVersion::V2 => ChunkServerReply::RegisterV2(payload),
            RegistrationVersion::V3 => ChunkServerReply::RegisterV3 { timeout, payload },
            RegistrationVersion::V4 => {
                let v = ProtocolVersion::current();
                ChunkServerReply::RegisterV4 {
                    version_major: v.major,
                    version_mid: v.mid,
                    version_min: v.min,
                    timeout,
                    payload,
                }
            }
        };
        self.last_register = Some(now);
        self.output.attach(reply.encode());
    }

    /// Polls the HDD store's telemetry for anything changed since the
    /// last tick and attaches the corresponding `CSTOMA_*` push frames,
    /// matching `masterconn_check_hdd_reports`'s per-cycle space/damaged/
    /// lost/error sweep.
    fn check_hdd_reports(&mut self) {
        let hdd = self.jobs.hdd();
        if hdd.space_changed() {
            let summary = hdd.chunk_list_summary();
            self.output.attach(
                ChunkServerReply::Space {
                    used_space: summary.used_space,
                    total_space: summary.total_space,
                    chunk_count: summary.chunk_count,
                    to_delete_used_space: summary.to_delete_used_space,
                    to_delete_total_space: summary.to_delete_total_space,
                    to_delete_chunk_count: summary.to_delete_chunk_count,
                }
                .encode(),
            );
        }
        let damaged = hdd.take_damaged_chunks();
        if !damaged.is_empty() {
            self.output.attach(ChunkServerReply::ChunkDamaged { chunk_ids: damaged }.encode());
        }
        let lost = hdd.take_lost_chunks();
        if !lost.is_empty() {
            self.output.attach(ChunkServerReply::ChunkLost { chunk_ids: lost }.encode());
        }
        if hdd.next_error_event() {
            self.output.attach(ChunkServerReply::ErrorOccurred.encode());
        }
    }

    /// Reads whatever is available without blocking and dispatches every
    /// complete frame that results. A frame-level protocol violation
    /// returns `Err`; the caller (the daemon's reactor) should call
    /// [`MasterConnection::kill`] in response.
    pub fn on_readable(&mut self) -> Result<(), MasterConnError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    return Err(MasterConnError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "master closed connection",
                    )));
                }
                Ok(n) => {
                    self.decoder.push_bytes(&buf[..n]);
                    self.last_activity = Instant::now();
                    metrics::counter!("chunksrv_masterconn_bytes_in_total").increment(n as u64);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        loop {
            match self.decoder.try_decode_one() {
                Ok(Some(frame)) => self.dispatch_frame(frame)?,
                Ok(None) => break,
                Err(FrameError::TooLarge { size }) => return Err(MasterConnError::FrameTooLarge { size }),
            }
        }
        Ok(())
    }

    fn dispatch_frame(&mut self, frame: Frame) -> Result<(), MasterConnError> {
        let frame_type = frame.msg_type;
        let cmd = MasterCommand::decode(&frame).map_err(|e| decode_error_to_masterconn(frame_type, e))?;
        self.handle_command(cmd)
    }

    fn handle_command(&mut self, cmd: MasterCommand) -> Result<(), MasterConnError> {
        match cmd {
            MasterCommand::Nop => {}
            MasterCommand::Create { chunk_id, version } => self.submit_chunk_op(ChunkOpKind::Create, chunk_id, version, 0, 0, 0, 0),
            MasterCommand::Delete { chunk_id, version } => self.submit_chunk_op(ChunkOpKind::Delete, chunk_id, version, 0, 0, 0, 0),
            MasterCommand::SetVersion {
                chunk_id,
                old_version,
                new_version,
            } => self.submit_chunk_op(ChunkOpKind::SetVersion, chunk_id, old_version, new_version, 0, 0, 0),
            MasterCommand::Duplicate {
                chunk_id,
                version,
                copy_chunk_id,
                copy_version,
            } => self.submit_chunk_op(ChunkOpKind::Duplicate, chunk_id, version, 0, copy_chunk_id, copy_version, 0),
            MasterCommand::Truncate {
                chunk_id,
                version,
                new_version,
                length,
            } => self.submit_chunk_op(ChunkOpKind::Truncate, chunk_id, version, new_version, 0, 0, length),
            MasterCommand::DupTrunc {
                chunk_id,
                version,
                copy_chunk_id,
                copy_version,
                length,
            } => self.submit_chunk_op(ChunkOpKind::DupTrunc, chunk_id, version, 0, copy_chunk_id, copy_version, length),
            MasterCommand::ChunkOp(req) => {
                let chunk_id = req.chunk_id;
                let version = req.version;
                let new_version = req.new_version;
                let copy_chunk_id = req.copy_chunk_id;
                let copy_version = req.copy_version;
                let length = req.length;
                let output = self.output.clone();
                let submitted = self.jobs.submit_chunk_op(
                    req,
                    Box::new(move |_id, result| {
                        let status = status_byte(result);
                        output.attach(
                            ChunkServerReply::ChunkOpStatus {
                                chunk_id,
                                version,
                                new_version,
                                copy_chunk_id,
                                copy_version,
                                length,
                                status,
                            }
                            .encode(),
                        );
                    }),
                );
                if submitted.is_err() {
                    warn!("job pool full, dropping chunkop for chunk {chunk_id}");
                }
            }
            MasterCommand::Replicate {
                chunk_id,
                version,
                sources,
            } => {
                let output = self.output.clone();
                let submitted = self.jobs.submit_replicate(
                    chunk_id,
                    version,
                    sources,
                    Box::new(move |_id, result| {
                        let status = status_byte(result);
                        output.attach(
                            ChunkServerReply::ReplicateStatus {
                                chunk_id,
                                version,
                                status,
                            }
                            .encode(),
                        );
                    }),
                );
                if submitted.is_err() {
                    warn!("job pool full, dropping replicate for chunk {chunk_id}");
                }
            }
            MasterCommand::StructureLog { version, entry } => {
                // Validated by `MasterCommand::decode` already; `entry`
                // here is the NUL-stripped text.
                let record = StructureLogEntry::decode(version, entry);
                if let Err(e) = self.changelog.append(&record) {
                    warn!("failed to append structure log entry: {e}");
                }
            }
            MasterCommand::StructureLogRotate => {
                if let Err(e) = self.changelog.rotate() {
                    warn!("failed to rotate structure log: {e}");
                }
            }
            MasterCommand::ChunkChecksum { chunk_id, version } => {
                let (checksum, status) = match self.jobs.hdd().checksum(chunk_id, version) {
                    Ok(c) => (c, 0),
                    Err(status) => (0, status),
                };
                self.output.attach(
                    ChunkServerReply::ChunkChecksum {
                        chunk_id,
                        version,
                        checksum,
                        status,
                    }
                    .encode(),
                );
            }
            MasterCommand::ChunkChecksumTab { chunk_id, version } => {
                let (checksum_tab, status) = match self.jobs.hdd().checksum_tab(chunk_id, version) {
                    Ok(tab) => (tab, 0),
                    Err(status) => (vec![0u8; CHECKSUM_TAB_SIZE], status),
                };
                self.output.attach(
                    ChunkServerReply::ChunkChecksumTab {
                        chunk_id,
                        version,
                        checksum_tab,
                        status,
                    }
                    .encode(),
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_chunk_op(
        &mut self,
        kind: ChunkOpKind,
        chunk_id: u64,
        version: u32,
        new_version: u32,
        copy_chunk_id: u64,
        copy_version: u32,
        length: u32,
    ) {
        let output = self.output.clone();
        let req = ChunkOpRequest {
            kind,
            chunk_id,
            version,
            new_version,
            copy_chunk_id,
            copy_version,
            length,
        };
        let submitted = self.jobs.submit_chunk_op(
            req,
            Box::new(move |_id, result| {
                let status = status_byte(result);
                output.attach(
                    ChunkServerReply::StatusOnly {
                        msg_type: chunk_op_status_msg_type(kind),
                        chunk_id,
                        status,
                    }
                    .encode(),
                );
            }),
        );
        if submitted.is_err() {
            warn!("job pool full, dropping {kind:?} for chunk {chunk_id}");
        }
    }

    /// Flushes whatever fits in the socket's send buffer without
    /// blocking. Partial writes are remembered in `pending_write` so the
    /// next call resumes mid-frame instead of re-encoding from the queue.
    pub fn on_writable(&mut self) -> Result<(), MasterConnError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        loop {
            if self.pending_write.is_empty() {
                match self.output.pop() {
                    Some(frame) => self.pending_write = frame.encode(),
                    None => break,
                }
            }
            match stream.write(&self.pending_write) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending_write.drain(0..n);
                    self.last_write = Instant::now();
                    metrics::counter!("chunksrv_masterconn_bytes_out_total").increment(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn wants_write(&self) -> bool {
        !self.pending_write.is_empty() || !self.output.is_empty()
    }

    /// Whether the job pool has room for another submission
    /// (`job_pool_can_add`). The reactor uses this to decide whether the
    /// master socket should still be selected for read: matching `desc`'s
    /// "select socket for read only if `can_add(jpool)`" rule, so a full
    /// job queue applies TCP-level backpressure to the master instead of
    /// accepting commands it cannot act on yet.
    pub fn jobs_can_add(&self) -> bool {
        self.jobs.can_add()
    }

    /// Exposes the connected stream so the daemon can reregister its
    /// selector interest (read-only vs. read+write) as backpressure
    /// changes. `None` while not connected.
    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Called on every reactor tick: injects a keepalive NOP once half
    /// the heartbeat interval passes with nothing queued to send, and
    /// reports a read timeout once a full interval passes with no
    /// inbound traffic, the way the original's `lastread`/`lastwrite`/
    /// `Timeout` bookkeeping does.
    pub fn on_timer(&mut self, now: Instant) -> Result<(), MasterConnError> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }
        let timeout = Duration::from_secs(self.config.clamped_master_timeout() as u64);
        let read_idle = now.duration_since(self.last_activity);
        if read_idle > timeout {
            return Err(MasterConnError::ReadTimeout {
                elapsed_secs: self.config.clamped_master_timeout(),
            });
        }
        let write_idle = now.duration_since(self.last_write);
        if write_idle > timeout / 2 && self.output.is_empty() {
            self.output.attach(nop_frame());
        }
        self.check_hdd_reports();
        Ok(())
    }

    /// Drains every completion the job pool has queued, running their
    /// callbacks (which attach reply frames to the output queue). Called
    /// by the daemon after observing the job pool's wakeup descriptor is
    /// readable.
    pub fn drain_job_completions(&self) -> usize {
        self.jobs.check_jobs()
    }
}

fn status_byte(result: JobResult) -> u8 {
    match result {
        JobResult::Status(s) => s,
        JobResult::Read { status, .. } => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunksrv_core::collaborators::{ChunkListSummary, ChunkRecord, ReplicationSource};
    use chunksrv_proto::bytes::Writer;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration as StdDuration;

    struct FakeHdd;
    impl HddStore for FakeHdd {
        fn open(&self, _c: u64, _v: u32) -> u8 {
            0
        }
        fn close(&self, _c: u64) -> u8 {
            0
        }
        fn read(&self, _c: u64, _v: u32, _o: u32, _s: u32, _b: &mut [u8]) -> u8 {
            0
        }
        fn write(&self, _c: u64, _v: u32, _o: u32, _d: &[u8]) -> u8 {
            0
        }
        fn chunk_op(&self, _req: ChunkOpRequest) -> u8 {
            0
        }
        fn chunk_list_summary(&self) -> ChunkListSummary {
            ChunkListSummary::default()
        }
        fn enumerate_chunks(&self) -> Vec<ChunkRecord> {
            Vec::new()
        }
    }

    struct FakeReplicator;
    impl Replicator for FakeReplicator {
        fn replicate(&self, _c: u64, _v: u32, _s: &[ReplicationSource]) -> u8 {
            0
        }
    }

    fn test_conn_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    fn test_connection() -> (
        MasterConnection<TcpStream, FakeHdd, FakeReplicator>,
        TcpStream,
        tempfile::TempDir,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let (jobs, _rx) = JobPool::new(2, 16, Arc::new(FakeHdd), Arc::new(FakeReplicator)).unwrap();
        let changelog = ChangelogSink::new(tmp.path(), 3);
        let mut conn = MasterConnection::new(jobs, changelog, ChunkServerConfig::default());
        let (client, server) = test_conn_pair();
        conn.attach_stream(server);
        (conn, client, tmp)
    }

    // S3: CREATE round-trip.
    #[test]
    fn create_command_round_trips_to_a_status_reply() {
        let (mut conn, mut peer, _tmp) = test_connection();
        // Drain the registration frame the attach queued.
        conn.on_writable().unwrap();
        read_one_frame(&mut peer);

        let mut body = Writer::new();
        body.u64(42).u32(1);
        let frame = Frame {
            msg_type: id::MATOCS_CREATE,
            body: body.into_vec(),
        };
        peer.write_all(&frame.encode()).unwrap();
        wait_readable(&mut conn);
        conn.on_readable().unwrap();

        wait_for_jobs(&conn);
        conn.drain_job_completions();
        conn.on_writable().unwrap();

        let reply = read_one_frame(&mut peer);
        assert_eq!(reply.msg_type, id::CSTOMA_CREATE);
        let mut r = chunksrv_proto::bytes::Reader::new(&reply.body);
        assert_eq!(r.u64().unwrap(), 42);
        assert_eq!(r.u8().unwrap(), 0);
    }

    fn wait_readable<S, H: HddStore + 'static, R: Replicator + 'static>(_conn: &mut MasterConnection<S, H, R>) {
        thread::sleep(StdDuration::from_millis(20));
    }

    fn wait_for_jobs<S, H: HddStore + 'static, R: Replicator + 'static>(conn: &MasterConnection<S, H, R>) {
        let deadline = Instant::now() + StdDuration::from_secs(2);
        while conn.jobs.pending_status_count() == 0 && Instant::now() < deadline {
            thread::sleep(StdDuration::from_millis(5));
        }
    }

    fn read_one_frame(stream: &mut TcpStream) -> Frame {
        let mut decoder = FrameDecoder::new();
        let deadline = Instant::now() + StdDuration::from_secs(2);
        loop {
            let mut buf = [0u8; 1024];
            match stream.read(&mut buf) {
                Ok(0) => panic!("peer closed"),
                Ok(n) => decoder.push_bytes(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        panic!("timed out waiting for frame");
                    }
                    thread::sleep(StdDuration::from_millis(5));
                    continue;
                }
                Err(e) => panic!("read error: {e}"),
            }
            if let Some(frame) = decoder.try_decode_one().unwrap() {
                return frame;
            }
        }
    }

    #[test]
    fn unknown_command_kills_the_connection_path() {
        let (mut conn, mut peer, _tmp) = test_connection();
        conn.on_writable().unwrap();
        read_one_frame(&mut peer);
        let frame = Frame {
            msg_type: 0xBEEF,
            body: vec![],
        };
        peer.write_all(&frame.encode()).unwrap();
        wait_readable(&mut conn);
        let result = conn.on_readable();
        assert!(matches!(result, Err(MasterConnError::UnknownCommand { command_type: 0xBEEF })));
    }

    #[test]
    fn registration_version_is_v4_on_first_connect() {
        let (conn, _peer, _tmp) = test_connection();
        assert!(conn.last_register.is_some());
    }
}
