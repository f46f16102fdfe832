use crate::config::ClientConfig;
use crate::constants::*;
use crate::error::LpmError;
use crate::frame::{Command, ControlFrame, Final, Frame, Header, Measurement, Request};
use crate::payload::LampReading;
use crate::session::Phase;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, info};

/// Everything one download produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub header: Header,
    pub measurements: Vec<Measurement>,
}

impl Download {
    /// Every sub-reading of every record, in engineering units
    pub fn readings(&self) -> Vec<LampReading> {
        self.measurements
            .iter()
            .flat_map(|m| m.data.lamp_readings())
            .collect()
    }
}

/// Client side of the download protocol.
pub struct LpmClient<S> {
    stream: S,
    config: ClientConfig,
}

impl LpmClient<TcpStream> {
    /// Connect to a server and consume its unsolicited greeting ACK.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self, LpmError> {
        let stream = timeout(config.request_timeout, TcpStream::connect(addr))
            .await
            .map_err(LpmError::from)
            .and_then(|connected| connected.map_err(LpmError::from))
            .map_err(|e| e.in_phase(Phase::Connect))?;
        if let Ok(peer) = stream.peer_addr() {
            info!("Connected to {}", peer);
        }

        let mut client = Self::from_stream(stream, config);
        client.read_greeting().await?;
        Ok(client)
    }
}

impl<S> LpmClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream. The greeting ACK has not been read.
    pub fn from_stream(stream: S, config: ClientConfig) -> Self {
        Self { stream, config }
    }

    /// Read and discard the ACK a server sends right after accepting.
    pub async fn read_greeting(&mut self) -> Result<(), LpmError> {
        let mut greeting = [0u8; CONTROL_LEN];
        self.read_exact(&mut greeting, Phase::Greeting).await?;
        debug!("Greeting: {:?}", String::from_utf8_lossy(&greeting));
        Ok(())
    }

    /// Run one download: request, header, records until the final frame.
    pub async fn download(&mut self, command: Command) -> Result<Download, LpmError> {
        let request = Request::new(command)
            .with_codes(self.config.user_code, self.config.plant_code)
            .with_block_select(self.config.block_select)
            .with_max_records(self.config.max_records);
        self.write(&request.encode(), Phase::Request).await?;
        info!("Sent {} request", command);

        let mut ack = [0u8; CONTROL_LEN];
        self.read_exact(&mut ack, Phase::RequestAck).await?;
        let answer = ControlFrame::classify(&ack);
        debug!("Request answered with {:?}", answer);
        if answer == Some(ControlFrame::Nak) {
            return Err(LpmError::Rejected.in_phase(Phase::RequestAck));
        }

        let mut header_block = [0u8; HEADER_LEN];
        self.read_exact(&mut header_block, Phase::Header).await?;
        let header = Header::decode(&header_block).map_err(|e| e.in_phase(Phase::Header))?;
        debug!(
            "Header checksum: calculated={}, received={}",
            header.computed_checksum(),
            header.checksum()
        );
        self.write(ControlFrame::Ack.as_bytes(), Phase::HeaderAck).await?;

        let mut measurements = Vec::new();
        while let Some(measurement) = self.next_record().await? {
            measurements.push(measurement);
            debug!("Received measure package {}", measurements.len());
            self.write(ControlFrame::Ack.as_bytes(), Phase::MeasurementAck).await?;
        }
        info!("Download {} complete with {} measurements", command, measurements.len());

        Ok(Download { header, measurements })
    }

    /// Read one record block; `None` marks the final frame.
    ///
    /// Measurement and final frames share the `PCD4` prefix, so three more
    /// bytes are read to tell them apart: `EOD` ends the download, anything
    /// else is the start of a measurement payload.
    async fn next_record(&mut self) -> Result<Option<Measurement>, LpmError> {
        let mut block = [0u8; MEASUREMENT_LEN];

        self.read_exact(&mut block[..1], Phase::Measurement).await?;
        if block[0] != STX {
            return Err(LpmError::Framing(format!("expected STX, got {:#04x}", block[0])).in_phase(Phase::Measurement));
        }

        self.read_exact(&mut block[1..5], Phase::Measurement).await?;
        if block[1..5] != RECORD_PREFIX {
            return Err(LpmError::Framing(format!("unknown message type: {}", hex::encode(&block[1..5])))
                .in_phase(Phase::Measurement));
        }

        self.read_exact(&mut block[5..8], Phase::Measurement).await?;
        if block[5..8] == END_OF_DOWNLOAD {
            self.read_exact(&mut block[8..FINAL_LEN], Phase::Final).await?;
            let final_frame = Final::decode(&block[..FINAL_LEN]).map_err(|e| e.in_phase(Phase::Final))?;
            debug!("Received final package: {}", String::from_utf8_lossy(&final_frame.end_download));
            return Ok(None);
        }

        self.read_exact(&mut block[8..], Phase::Measurement).await?;
        let measurement = Measurement::decode(&block).map_err(|e| e.in_phase(Phase::Measurement))?;
        Ok(Some(measurement))
    }

    async fn read_exact(&mut self, buf: &mut [u8], phase: Phase) -> Result<(), LpmError> {
        timeout(self.config.request_timeout, self.stream.read_exact(buf))
            .await
            .map_err(LpmError::from)
            .and_then(|read| read.map(|_| ()).map_err(LpmError::from))
            .map_err(|e| e.in_phase(phase))
    }

    async fn write(&mut self, bytes: &[u8], phase: Phase) -> Result<(), LpmError> {
        let deadline = self.config.request_timeout;
        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        timeout(deadline, write)
            .await
            .map_err(LpmError::from)
            .and_then(|written| written.map_err(LpmError::from))
            .map_err(|e| e.in_phase(phase))
    }
}
