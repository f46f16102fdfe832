//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use fakelpm_lib::constants::*;
#[allow(unused_imports)]
pub use fakelpm_lib::error::LpmError;
#[allow(unused_imports)]
pub use fakelpm_lib::frame::{Command, ControlFrame, Final, Frame, Header, Measurement, Request};
#[allow(unused_imports)]
pub use fakelpm_lib::payload::MeasurementData;

use chrono::NaiveDate;
use fakelpm_lib::archive::{SAMPLE_ARCHIVES, decode_archive_blob};
use fakelpm_lib::clock::{Clock, FixedClock};
use fakelpm_lib::registry::ConnectionRegistry;
use fakelpm_lib::source::MeasurementSource;
use fakelpm_lib::{LpmServer, ServerConfig, SessionConfig, ShutdownHandle};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Route library logs to the test harness; `RUST_LOG=debug` shows frames.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// First payload of the built-in archive: pole 0x0625, 2024-11-18.
#[allow(dead_code)]
pub fn sample_payload() -> MeasurementData {
    decode_archive_blob(SAMPLE_ARCHIVES[0]).expect("sample archive decodes")[0]
}

/// 2024-11-18 09:05, the clock every test header is stamped with.
#[allow(dead_code)]
pub fn fixed_clock() -> Arc<dyn Clock> {
    let now = NaiveDate::from_ymd_opt(2024, 11, 18)
        .and_then(|d| d.and_hms_opt(9, 5, 0))
        .expect("valid date");
    Arc::new(FixedClock(now))
}

/// Serves the same payload a fixed number of times per download.
#[allow(dead_code)]
pub struct FixedSource {
    pub batch: usize,
    pub payload: MeasurementData,
}

impl MeasurementSource for FixedSource {
    fn batch_len(&self) -> usize {
        self.batch
    }

    fn next_payload(&self) -> MeasurementData {
        self.payload
    }
}

#[allow(dead_code)]
pub fn fixed_source(batch: usize) -> Arc<dyn MeasurementSource> {
    Arc::new(FixedSource {
        batch,
        payload: sample_payload(),
    })
}

/// A server on an ephemeral loop-back port, already accepting.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: ShutdownHandle,
    pub registry: Arc<ConnectionRegistry>,
    pub task: JoinHandle<Result<(), LpmError>>,
}

#[allow(dead_code)]
pub async fn start_server(session: SessionConfig, source: Arc<dyn MeasurementSource>) -> TestServer {
    init_tracing();
    let config = ServerConfig::default()
        .with_bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .with_session(session);
    let server = LpmServer::bind(config)
        .await
        .expect("bind loop-back listener")
        .with_source(source)
        .with_clock(fixed_clock());

    TestServer {
        addr: server.local_addr().expect("local address"),
        shutdown: server.shutdown_handle(),
        registry: server.registry(),
        task: tokio::spawn(server.run()),
    }
}

/// Poll `condition` for up to two seconds.
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
