//! Serving a layer's archive, whole or by byte range.
//!
//! Each request opens its own reader and closes it before returning, whatever the
//! outcome.
use std::path::{Path, PathBuf};

use axum::http::{header, HeaderName, StatusCode};
use bytes::Bytes;
use tracing::debug;

use crate::archive::{ArchiveOpener, MmapOpener, RangeRead};
use crate::layer::Layer;
use crate::range::ByteRange;
use crate::Error;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/octet-stream";

/// A framed archive response: `200` with the whole file or `206` with a slice of it.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveResponse {
    pub status: StatusCode,
    pub content_range: Option<String>,
    pub body: Bytes,
}

impl ArchiveResponse {
    pub fn headers(&self) -> Vec<(HeaderName, String)> {
        let mut headers = vec![
            (header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE.to_string()),
            (header::CONTENT_LENGTH, self.body.len().to_string()),
            (header::ACCEPT_RANGES, String::from("bytes")),
        ];
        if let Some(content_range) = &self.content_range {
            headers.push((header::CONTENT_RANGE, content_range.clone()));
        }
        headers
    }

    pub fn header(&self, name: &HeaderName) -> Option<String> {
        self.headers()
            .into_iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value)
    }
}

/// Answers archive requests for layers.
#[derive(Clone, Debug)]
pub struct ArchiveHttpServer<O = MmapOpener> {
    opener: O,
    archive_root: PathBuf,
}

impl ArchiveHttpServer<MmapOpener> {
    pub fn with_root(archive_root: impl Into<PathBuf>) -> Self {
        ArchiveHttpServer::new(MmapOpener, archive_root)
    }
}

impl<O: ArchiveOpener> ArchiveHttpServer<O> {
    pub fn new(opener: O, archive_root: impl Into<PathBuf>) -> Self {
        ArchiveHttpServer {
            opener,
            archive_root: archive_root.into(),
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Where a layer's archive lives on disk, if it has one.
    pub fn archive_path(&self, layer: &Layer) -> Option<PathBuf> {
        layer
            .archive
            .as_ref()
            .map(|archive| self.archive_root.join(archive))
    }

    /// Serves the archive of `layer`.
    ///
    /// `range_header` is the value of the request's `Range` header. A missing,
    /// unready or archive-less layer, or an archive absent from disk, is
    /// [`Error::NotFound`]. A header that does not parse is
    /// [`Error::MalformedRangeHeader`] and the archive is never opened.
    pub fn serve(
        &self,
        layer: Option<&Layer>,
        range_header: Option<&str>,
    ) -> Result<ArchiveResponse, Error> {
        self.serve_raw(layer, range_header.map(str::as_bytes))
    }

    /// Like [`Self::serve`], with the `Range` header as it came off the wire. The
    /// header is only decoded once the archive is known to exist, so a missing
    /// archive is [`Error::NotFound`] whatever the header holds.
    pub fn serve_raw(
        &self,
        layer: Option<&Layer>,
        range_header: Option<&[u8]>,
    ) -> Result<ArchiveResponse, Error> {
        let layer = layer.filter(|layer| layer.is_ready).ok_or(Error::NotFound)?;
        let path = self.archive_path(layer).ok_or(Error::NotFound)?;
        if !path.exists() {
            debug!(layer = %layer.id, path = %path.display(), "archive missing on disk");
            return Err(Error::NotFound);
        }

        let range = match range_header.map(decode_header).transpose()?.map(str::trim) {
            None | Some("") => None,
            Some(header) => Some(header.parse::<ByteRange>()?),
        };

        let mut reader = self.opener.open(&path)?;
        let response = respond(&reader, range);
        reader.close();

        if let Ok(response) = &response {
            debug!(
                layer = %layer.id,
                status = response.status.as_u16(),
                bytes = response.body.len(),
                "served archive"
            );
        }
        response
    }
}

fn decode_header(raw: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(raw)
        .map_err(|_| Error::MalformedRangeHeader(String::from_utf8_lossy(raw).into_owned()))
}

fn respond<R: RangeRead>(reader: &R, range: Option<ByteRange>) -> Result<ArchiveResponse, Error> {
    let Some(range) = range else {
        return Ok(ArchiveResponse {
            status: StatusCode::OK,
            content_range: None,
            body: reader.read_all()?,
        });
    };

    let size = reader.len();
    let body = reader.read_range(range.start, range.requested_len(size))?;
    let last = (range.start + body.len() as u64).saturating_sub(1);

    Ok(ArchiveResponse {
        status: StatusCode::PARTIAL_CONTENT,
        content_range: Some(format!("bytes {}-{}/{}", range.start, last, size)),
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::NamedTempFile;

    use super::*;

    fn test_data() -> Vec<u8> {
        (0..1000).map(|i| (i % 256) as u8).collect()
    }

    struct Fixture {
        file: NamedTempFile,
        layer: Layer,
        server: ArchiveHttpServer,
    }

    fn fixture() -> Fixture {
        let mut file = NamedTempFile::new().expect("Unable to create a temp archive.");
        file.write_all(&test_data()).unwrap();
        file.flush().unwrap();

        let mut layer = Layer::new("Test Layer 1");
        layer.is_ready = true;
        layer.archive = file.path().file_name().map(PathBuf::from);

        let root = file.path().parent().unwrap().to_path_buf();
        Fixture {
            file,
            layer,
            server: ArchiveHttpServer::with_root(root),
        }
    }

    #[test]
    fn test_serve_full_file() {
        let fixture = fixture();
        let response = fixture.server.serve(Some(&fixture.layer), None).unwrap();

        assert_eq!(StatusCode::OK, response.status);
        assert_eq!(&test_data()[..], &response.body[..]);
        assert_eq!(
            Some(String::from("application/octet-stream")),
            response.header(&header::CONTENT_TYPE)
        );
        assert_eq!(Some(String::from("1000")), response.header(&header::CONTENT_LENGTH));
        assert_eq!(Some(String::from("bytes")), response.header(&header::ACCEPT_RANGES));
        assert_eq!(None, response.header(&header::CONTENT_RANGE));
        assert!(fixture.file.path().exists());
    }

    #[test]
    fn test_empty_range_header_serves_full_file() {
        let fixture = fixture();
        let response = fixture.server.serve(Some(&fixture.layer), Some("  ")).unwrap();
        assert_eq!(StatusCode::OK, response.status);
        assert_eq!(1000, response.body.len());
    }

    #[test]
    fn test_serve_partial_content() {
        let fixture = fixture();
        let response = fixture
            .server
            .serve(Some(&fixture.layer), Some("bytes=0-99"))
            .unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status);
        assert_eq!(&test_data()[0..100], &response.body[..]);
        assert_eq!(Some(String::from("100")), response.header(&header::CONTENT_LENGTH));
        assert_eq!(
            Some(String::from("bytes 0-99/1000")),
            response.header(&header::CONTENT_RANGE)
        );
        assert_eq!(Some(String::from("bytes")), response.header(&header::ACCEPT_RANGES));
    }

    #[test]
    fn test_range_past_end_is_truncated() {
        let fixture = fixture();
        let response = fixture
            .server
            .serve(Some(&fixture.layer), Some("bytes=990-1020"))
            .unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status);
        assert_eq!(Some(String::from("10")), response.header(&header::CONTENT_LENGTH));
        assert_eq!(
            Some(String::from("bytes 990-999/1000")),
            response.header(&header::CONTENT_RANGE)
        );
        assert_eq!(&test_data()[990..], &response.body[..]);
    }

    #[test]
    fn test_range_end_omitted() {
        let fixture = fixture();
        let response = fixture
            .server
            .serve(Some(&fixture.layer), Some("bytes=500-"))
            .unwrap();

        assert_eq!(Some(String::from("500")), response.header(&header::CONTENT_LENGTH));
        assert_eq!(
            Some(String::from("bytes 500-999/1000")),
            response.header(&header::CONTENT_RANGE)
        );
    }

    #[test]
    fn test_last_byte() {
        let fixture = fixture();
        let response = fixture
            .server
            .serve(Some(&fixture.layer), Some("bytes=999-"))
            .unwrap();

        assert_eq!(1, response.body.len());
        assert_eq!(
            Some(String::from("bytes 999-999/1000")),
            response.header(&header::CONTENT_RANGE)
        );
    }

    #[test]
    fn test_repeated_ranges_are_identical() {
        let fixture = fixture();
        let first = fixture
            .server
            .serve(Some(&fixture.layer), Some("bytes=100-199"))
            .unwrap();
        let second = fixture
            .server
            .serve(Some(&fixture.layer), Some("bytes=100-199"))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_range_header() {
        let fixture = fixture();
        assert!(matches!(
            fixture.server.serve(Some(&fixture.layer), Some("bytes=invalid")),
            Err(Error::MalformedRangeHeader(_))
        ));
    }

    #[test]
    fn test_range_start_past_end() {
        let fixture = fixture();
        assert!(matches!(
            fixture.server.serve(Some(&fixture.layer), Some("bytes=1000-")),
            Err(Error::InvalidOffset { offset: 1000, size: 1000 })
        ));
    }

    #[test]
    fn test_not_found() {
        let fixture = fixture();
        assert!(matches!(
            fixture.server.serve(None, None),
            Err(Error::NotFound)
        ));

        let mut unready = fixture.layer.clone();
        unready.is_ready = false;
        assert!(matches!(
            fixture.server.serve(Some(&unready), None),
            Err(Error::NotFound)
        ));

        let mut no_archive = fixture.layer.clone();
        no_archive.archive = None;
        assert!(matches!(
            fixture.server.serve(Some(&no_archive), None),
            Err(Error::NotFound)
        ));

        let mut missing = fixture.layer.clone();
        missing.archive = Some(PathBuf::from("does-not-exist.pmtiles"));
        assert!(matches!(
            fixture.server.serve(Some(&missing), Some("bytes=invalid")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_undecodable_range_header() {
        let fixture = fixture();
        let raw: &[u8] = b"bytes=\xff-";

        assert!(matches!(
            fixture.server.serve_raw(Some(&fixture.layer), Some(raw)),
            Err(Error::MalformedRangeHeader(_))
        ));
        assert!(matches!(
            fixture.server.serve_raw(None, Some(raw)),
            Err(Error::NotFound)
        ));

        let mut missing = fixture.layer.clone();
        missing.archive = Some(PathBuf::from("does-not-exist.pmtiles"));
        assert!(matches!(
            fixture.server.serve_raw(Some(&missing), Some(raw)),
            Err(Error::NotFound)
        ));
    }

    /// Records how often readers are opened and closed.
    #[derive(Clone, Default)]
    struct CountingOpener {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    struct CountingReader {
        closed: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    impl RangeRead for CountingReader {
        fn len(&self) -> u64 {
            1000
        }

        fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, Error> {
            if self.fail_reads {
                return Err(Error::Archive {
                    path: PathBuf::from("test.pmtiles"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "Test error"),
                });
            }
            let data = test_data();
            let end = (offset + length).min(1000) as usize;
            Ok(Bytes::copy_from_slice(&data[offset as usize..end]))
        }

        fn read_all(&self) -> Result<Bytes, Error> {
            self.read_range(0, 1000)
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ArchiveOpener for CountingOpener {
        type Reader = CountingReader;

        fn open(&self, _path: &Path) -> Result<CountingReader, Error> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(CountingReader {
                closed: self.closed.clone(),
                fail_reads: self.fail_reads,
            })
        }
    }

    fn counting_server(fail_reads: bool) -> (Fixture, CountingOpener, ArchiveHttpServer<CountingOpener>) {
        let fixture = fixture();
        let opener = CountingOpener {
            fail_reads,
            ..CountingOpener::default()
        };
        let root = fixture.server.archive_root().to_path_buf();
        let server = ArchiveHttpServer::new(opener.clone(), root);
        (fixture, opener, server)
    }

    #[test]
    fn test_reader_closed_after_success() {
        let (fixture, opener, server) = counting_server(false);

        server.serve(Some(&fixture.layer), None).unwrap();
        server.serve(Some(&fixture.layer), Some("bytes=0-99")).unwrap();

        assert_eq!(2, opener.opened.load(Ordering::SeqCst));
        assert_eq!(2, opener.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_closed_on_error() {
        let (fixture, opener, server) = counting_server(true);

        assert!(matches!(
            server.serve(Some(&fixture.layer), Some("bytes=0-99")),
            Err(Error::Archive { .. })
        ));
        assert_eq!(1, opener.opened.load(Ordering::SeqCst));
        assert_eq!(1, opener.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_malformed_header_never_opens_reader() {
        let (fixture, opener, server) = counting_server(false);

        assert!(matches!(
            server.serve(Some(&fixture.layer), Some("bytes=invalid")),
            Err(Error::MalformedRangeHeader(_))
        ));
        assert_eq!(0, opener.opened.load(Ordering::SeqCst));
        assert_eq!(0, opener.closed.load(Ordering::SeqCst));
    }
}
