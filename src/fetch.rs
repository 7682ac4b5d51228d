//! Chunked download of one remote artifact into a local sink.

use std::time::Duration;

use crate::error::{BootstrapError, Result, ResultExt};
use crate::metrics;
use crate::pb;
use crate::proxy::BootstrapTransport;

/// Append-only destination for downloaded bytes. Satisfied by a log segment
/// file on disk and by a newly created writable block.
pub trait DownloadSink {
    fn append(&mut self, data: &[u8]) -> Result<()>;
}

impl DownloadSink for Vec<u8> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Downloads one artifact chunk by chunk, verifying each chunk's offset and
/// CRC32C before appending it to the sink.
pub(crate) struct FileDownloader<'a> {
    transport: &'a mut dyn BootstrapTransport,
    session_id: &'a str,
    fetch_timeout: Duration,
    max_length: u64,
}

impl<'a> FileDownloader<'a> {
    pub fn new(
        transport: &'a mut dyn BootstrapTransport,
        session_id: &'a str,
        fetch_timeout: Duration,
        max_length: u64,
    ) -> Self {
        FileDownloader {
            transport,
            session_id,
            fetch_timeout,
            max_length,
        }
    }

    pub async fn download(
        &mut self,
        data_id: &pb::DataId,
        sink: &mut dyn DownloadSink,
    ) -> Result<()> {
        let label = metrics::data_type_label(data_id);
        let mut offset: u64 = 0;
        loop {
            let req = pb::FetchDataRequest {
                session_id: self.session_id.to_string(),
                data_id: Some(data_id.clone()),
                offset,
                max_length: self.max_length,
            };
            let resp = {
                let _timer = metrics::FETCH_COST_HISTOGRAM
                    .with_label_values(&[label])
                    .start_timer();
                self.transport
                    .fetch_data(req, self.fetch_timeout)
                    .await
                    .context("Unable to fetch data from remote")?
            };
            let chunk = resp.chunk.ok_or_else(|| {
                BootstrapError::InvalidArgument(
                    "fetch response is missing its data chunk".to_string(),
                )
            })?;

            // Sanity-check for corruption.
            verify_data(offset, &chunk).context(format!(
                "Error validating data item {}",
                data_id_to_string(data_id)
            ))?;

            sink.append(&chunk.data)?;
            metrics::BYTES_FETCHED_COUNTER
                .with_label_values(&[label])
                .inc_by(chunk.data.len() as f64);

            let len = chunk.data.len() as u64;
            if offset + len == chunk.total_data_length {
                return Ok(());
            }
            if len == 0 {
                return Err(BootstrapError::InvalidArgument(format!(
                    "server sent an empty chunk at offset {} before the end of the data ({} bytes)",
                    offset, chunk.total_data_length
                )));
            }
            offset += len;
        }
    }
}

/// Checks one received chunk against the position we asked for and its
/// declared CRC32C.
pub(crate) fn verify_data(offset: u64, chunk: &pb::DataChunk) -> Result<()> {
    if offset != chunk.offset {
        return Err(BootstrapError::InvalidArgument(format!(
            "Offset did not match what was asked for: {} vs {}",
            offset, chunk.offset
        )));
    }
    let crc32 = crc32c::crc32c(&chunk.data);
    if crc32 != chunk.crc32 {
        return Err(BootstrapError::Corruption(format!(
            "CRC32 does not match at offset {} size {}: {} vs {}",
            offset,
            chunk.data.len(),
            crc32,
            chunk.crc32
        )));
    }
    Ok(())
}

pub(crate) fn data_id_to_string(data_id: &pb::DataId) -> String {
    match data_id.kind() {
        pb::DataType::LogSegment => {
            format!("LOG_SEGMENT seqno {}", data_id.wal_segment_seqno)
        }
        pb::DataType::Block => format!(
            "BLOCK id {}",
            data_id.block_id.as_ref().map(|b| b.id).unwrap_or(0)
        ),
        pb::DataType::Unknown => "UNKNOWN".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn chunk(offset: u64, data: Vec<u8>, total: u64) -> pb::DataChunk {
        pb::DataChunk {
            offset,
            crc32: crc32c::crc32c(&data),
            total_data_length: total,
            data,
        }
    }

    #[test]
    fn verify_accepts_a_matching_chunk() {
        let chunk = chunk(0, b"hello".to_vec(), 5);
        verify_data(0, &chunk).unwrap();
    }

    #[test]
    fn verify_rejects_an_offset_mismatch() {
        let chunk = chunk(100, b"hello".to_vec(), 5);
        let err = verify_data(0, &chunk).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidArgument(_)));
        assert!(err
            .to_string()
            .contains("Offset did not match what was asked for: 0 vs 100"));
    }

    #[test]
    fn verify_rejects_a_bad_crc() {
        let mut chunk = chunk(0, b"hello".to_vec(), 5);
        chunk.crc32 = 0xDEAD_BEEF;
        let err = verify_data(0, &chunk).unwrap_err();
        assert!(matches!(err, BootstrapError::Corruption(_)));
        assert!(err.to_string().contains("CRC32 does not match"));
    }

    struct ScriptedTransport {
        responses: VecDeque<pb::FetchDataResponse>,
        requests: Vec<pb::FetchDataRequest>,
    }

    #[tonic::async_trait]
    impl BootstrapTransport for ScriptedTransport {
        async fn begin_session(
            &mut self,
            _req: pb::BeginSessionRequest,
            _deadline: Duration,
        ) -> Result<pb::BeginSessionResponse> {
            unimplemented!("not used by the download loop")
        }

        async fn fetch_data(
            &mut self,
            req: pb::FetchDataRequest,
            _deadline: Duration,
        ) -> Result<pb::FetchDataResponse> {
            self.requests.push(req);
            Ok(self.responses.pop_front().expect("ran out of responses"))
        }

        async fn end_session(
            &mut self,
            _req: pb::EndSessionRequest,
            _deadline: Duration,
        ) -> Result<pb::EndSessionResponse> {
            unimplemented!("not used by the download loop")
        }
    }

    #[derive(Default)]
    struct CountingSink {
        appends: Vec<usize>,
        bytes: Vec<u8>,
    }

    impl DownloadSink for CountingSink {
        fn append(&mut self, data: &[u8]) -> Result<()> {
            self.appends.push(data.len());
            self.bytes.extend_from_slice(data);
            Ok(())
        }
    }

    fn segment_data_id(seqno: u64) -> pb::DataId {
        pb::DataId {
            kind: pb::DataType::LogSegment as i32,
            block_id: None,
            wal_segment_seqno: seqno,
        }
    }

    #[tokio::test]
    async fn reassembles_a_multi_chunk_artifact() {
        const MIB: usize = 1024 * 1024;
        let sizes = [4 * MIB, 4 * MIB, 2 * MIB - 7, 7];
        let total: usize = sizes.iter().sum();
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let mut responses = VecDeque::new();
        let mut offset = 0usize;
        for size in sizes {
            responses.push_back(pb::FetchDataResponse {
                chunk: Some(chunk(
                    offset as u64,
                    data[offset..offset + size].to_vec(),
                    total as u64,
                )),
            });
            offset += size;
        }

        let mut transport = ScriptedTransport {
            responses,
            requests: Vec::new(),
        };
        let mut sink = CountingSink::default();
        let mut downloader = FileDownloader::new(
            &mut transport,
            "session-1",
            Duration::from_secs(1),
            64 * MIB as u64,
        );
        downloader
            .download(&segment_data_id(17), &mut sink)
            .await
            .unwrap();

        // Exactly the four appends, in order, and nothing requested past the
        // declared total length.
        assert_eq!(sink.appends, sizes.to_vec());
        assert_eq!(sink.bytes, data);
        assert!(transport.responses.is_empty());
        let offsets: Vec<u64> = transport.requests.iter().map(|r| r.offset).collect();
        assert_eq!(
            offsets,
            vec![0, 4 * MIB as u64, 8 * MIB as u64, (total - 7) as u64]
        );
    }

    #[tokio::test]
    async fn zero_length_artifact_finishes_after_one_chunk() {
        let mut transport = ScriptedTransport {
            responses: VecDeque::from([pb::FetchDataResponse {
                chunk: Some(chunk(0, Vec::new(), 0)),
            }]),
            requests: Vec::new(),
        };
        let mut sink = CountingSink::default();
        let mut downloader =
            FileDownloader::new(&mut transport, "session-1", Duration::from_secs(1), 1024);
        downloader
            .download(&segment_data_id(1), &mut sink)
            .await
            .unwrap();
        assert!(sink.bytes.is_empty());
        assert_eq!(transport.requests.len(), 1);
    }

    #[tokio::test]
    async fn empty_chunk_before_the_end_is_rejected() {
        let mut transport = ScriptedTransport {
            responses: VecDeque::from([pb::FetchDataResponse {
                chunk: Some(chunk(0, Vec::new(), 100)),
            }]),
            requests: Vec::new(),
        };
        let mut sink = CountingSink::default();
        let mut downloader =
            FileDownloader::new(&mut transport, "session-1", Duration::from_secs(1), 1024);
        let err = downloader
            .download(&segment_data_id(1), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidArgument(_)), "{err}");
    }

    #[tokio::test]
    async fn corruption_error_names_the_data_item() {
        let mut bad = chunk(0, b"hello".to_vec(), 5);
        bad.crc32 ^= 1;
        let mut transport = ScriptedTransport {
            responses: VecDeque::from([pb::FetchDataResponse { chunk: Some(bad) }]),
            requests: Vec::new(),
        };
        let mut sink = CountingSink::default();
        let mut downloader =
            FileDownloader::new(&mut transport, "session-1", Duration::from_secs(1), 1024);
        let err = downloader
            .download(&segment_data_id(17), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Corruption(_)), "{err}");
        assert!(err
            .to_string()
            .contains("Error validating data item LOG_SEGMENT seqno 17"));
    }
}
