//! Storage backends.
//!
//! The sorter never touches files directly: the input and every chunk are opened through a [`Storage`]
//! implementation, which also owns compression and naming conventions.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression hint passed to the storage when a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed data.
    Plain,
    /// Gzip compressed data.
    Gzip,
    /// Detect compression from the stream content (reading only).
    Detect,
}

/// Storage interface.
pub trait Storage: Send + Sync + 'static {
    /// Buffered stream reader.
    type Reader: BufRead + Send + 'static;
    /// Stream writer. Data is guaranteed to be persisted only after [`Storage::commit`].
    type Writer: Write + Send;

    /// Opens a stream for reading.
    fn open_read(&self, name: &str, compression: Compression) -> io::Result<Self::Reader>;

    /// Creates (or truncates) a stream for writing.
    fn create(&self, name: &str, compression: Compression) -> io::Result<Self::Writer>;

    /// Flushes and finalizes a writer created by [`Storage::create`].
    fn commit(&self, writer: Self::Writer) -> io::Result<()>;

    /// Removes a stream.
    fn remove(&self, name: &str) -> io::Result<()>;

    /// Returns the name suffix used for streams with the given compression.
    fn extension(&self, compression: Compression) -> &'static str {
        match compression {
            Compression::Gzip => ".gz",
            Compression::Plain | Compression::Detect => "",
        }
    }
}

/// Local file system storage. Stream names are resolved relative to the root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    rw_buf_size: Option<usize>,
}

impl LocalStorage {
    /// Creates a storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStorage {
            root: root.into(),
            rw_buf_size: None,
        }
    }

    /// Sets file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> Self {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        LocalStorage::new(".")
    }
}

/// [`LocalStorage`] file writer.
pub enum FileWriter {
    Plain(io::BufWriter<fs::File>),
    Gzip(GzEncoder<io::BufWriter<fs::File>>),
}

impl FileWriter {
    fn finish(self) -> io::Result<()> {
        let mut writer = match self {
            FileWriter::Plain(writer) => writer,
            FileWriter::Gzip(encoder) => encoder.finish()?,
        };
        writer.flush()?;

        return Ok(());
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Plain(writer) => writer.write(buf),
            FileWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Plain(writer) => writer.flush(),
            FileWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

impl Storage for LocalStorage {
    type Reader = Box<dyn BufRead + Send>;
    type Writer = FileWriter;

    fn open_read(&self, name: &str, compression: Compression) -> io::Result<Self::Reader> {
        let file = fs::File::open(self.path(name))?;
        let mut reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let gzipped = match compression {
            Compression::Plain => false,
            Compression::Gzip => true,
            Compression::Detect => reader.fill_buf()?.starts_with(&GZIP_MAGIC),
        };

        if gzipped {
            log::trace!("opening {} as a gzip stream", name);
            Ok(Box::new(io::BufReader::new(MultiGzDecoder::new(reader))))
        } else {
            Ok(Box::new(reader))
        }
    }

    fn create(&self, name: &str, compression: Compression) -> io::Result<Self::Writer> {
        let file = fs::File::create(self.path(name))?;
        let writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        return Ok(match compression {
            Compression::Gzip => FileWriter::Gzip(GzEncoder::new(writer, flate2::Compression::default())),
            Compression::Plain | Compression::Detect => FileWriter::Plain(writer),
        });
    }

    fn commit(&self, writer: Self::Writer) -> io::Result<()> {
        writer.finish()
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path(name))
    }
}
