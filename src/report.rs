//! Measurement report output.
//!
//! Every completed observation (a response at the requester, a request
//! at the responder) becomes one report record on standard output,
//! either as a CSV row or as a bincode-serialized record for machine
//! consumption.

use std::io::Write;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::ProbePayload;

/// Report serialization format.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human-readable rows with a header line.
    Csv,
    /// Length-delimited bincode records.
    Binary,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("report serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
}

/// One observation as serialized in binary reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub peer: SocketAddr,
    pub hostname: Option<String>,
    pub payload: ProbePayload,
}

/// Writes observations to a sink in the configured format.
pub struct Reporter {
    format: ReportFormat,
    sink: Box<dyn Write + Send>,
}

impl Reporter {
    pub fn new(format: ReportFormat, sink: Box<dyn Write + Send>) -> Self {
        Reporter { format, sink }
    }

    /// A reporter writing to standard output.
    pub fn stdout(format: ReportFormat) -> Self {
        Self::new(format, Box::new(std::io::stdout()))
    }

    /// Writes the CSV header. A no-op for binary reports.
    pub fn write_header(&mut self) -> Result<(), ReportError> {
        if self.format == ReportFormat::Csv {
            writeln!(
                self.sink,
                "peer,hostname,type,seq,seq_len,requester_key,responder_key,\
                 ttl_sent,ttl_seen,ttl_resp,mono_sent,real_sent,mono_recv,real_recv,rtt_ns"
            )?;
        }
        Ok(())
    }

    /// Writes one observation. `rtt_ns` is present only at the
    /// requester, where both ends of the round trip are known.
    pub fn write_event(
        &mut self,
        payload: &ProbePayload,
        peer: SocketAddr,
        hostname: Option<&str>,
        rtt_ns: Option<u64>,
    ) -> Result<(), ReportError> {
        match self.format {
            ReportFormat::Csv => {
                writeln!(
                    self.sink,
                    "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                    peer,
                    hostname.unwrap_or(""),
                    payload.message_type,
                    payload.sequence_number,
                    payload.sequence_length,
                    payload.requester_key,
                    payload.responder_key,
                    payload.ttl_sent_by_requester,
                    payload.ttl_seen_by_responder,
                    payload.ttl_sent_by_responder,
                    payload.monotonic_time_sent,
                    payload.real_time_sent,
                    payload.monotonic_time_received,
                    payload.real_time_received,
                    rtt_ns.map(|v| v.to_string()).unwrap_or_default(),
                )?;
            }
            ReportFormat::Binary => {
                let record = ReportRecord {
                    peer,
                    hostname: hostname.map(str::to_string),
                    payload: *payload,
                };
                bincode::serialize_into(&mut self.sink, &record)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ReportError> {
        self.sink.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{MessageType, FORMAT_VERSION, MAGIC, PAYLOAD_SIZE};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn payload() -> ProbePayload {
        ProbePayload {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            message_type: MessageType::Response.wire(),
            port: 7373,
            ttl_sent_by_requester: 64,
            ttl_seen_by_responder: 60,
            ttl_sent_by_responder: 64,
            ip_version: 4,
            extended_length: PAYLOAD_SIZE as u16,
            sequence_number: 3,
            sequence_length: 10,
            address_low: 0x0100_007F,
            address_high: 0,
            requester_key: 11,
            responder_key: 22,
            monotonic_time_sent: 100,
            real_time_sent: 200,
            monotonic_time_received: 300,
            real_time_received: 400,
        }
    }

    #[test]
    fn test_csv_report_has_header_and_row() {
        let sink = SharedSink::default();
        let mut reporter = Reporter::new(ReportFormat::Csv, Box::new(sink.clone()));
        reporter.write_header().unwrap();
        reporter
            .write_event(
                &payload(),
                "127.0.0.1:7373".parse().unwrap(),
                Some("localhost"),
                Some(1234),
            )
            .unwrap();
        reporter.flush().unwrap();

        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let mut lines = out.lines();
        assert!(lines.next().unwrap().starts_with("peer,hostname,"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("127.0.0.1:7373,localhost,2,3,10,11,22,"));
        assert!(row.ends_with(",1234"));
    }

    #[test]
    fn test_csv_missing_rtt_is_empty_field() {
        let sink = SharedSink::default();
        let mut reporter = Reporter::new(ReportFormat::Csv, Box::new(sink.clone()));
        reporter
            .write_event(&payload(), "127.0.0.1:7373".parse().unwrap(), None, None)
            .unwrap();
        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(out.trim_end().ends_with(','));
    }

    #[test]
    fn test_binary_report_roundtrips() {
        let sink = SharedSink::default();
        let mut reporter = Reporter::new(ReportFormat::Binary, Box::new(sink.clone()));
        reporter.write_header().unwrap();
        reporter
            .write_event(
                &payload(),
                "[::1]:7373".parse().unwrap(),
                Some("localhost"),
                None,
            )
            .unwrap();

        let bytes = sink.0.lock().unwrap().clone();
        let record: ReportRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record.peer, "[::1]:7373".parse::<SocketAddr>().unwrap());
        assert_eq!(record.hostname.as_deref(), Some("localhost"));
        assert_eq!(record.payload, payload());
    }
}
