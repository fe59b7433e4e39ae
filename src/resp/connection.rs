use std::io::Cursor;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::RedisSettings;
use crate::resp::Frame;
use crate::utils::error::{ProtocolError, RedisError};

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Buffered RESP connection to a Redis server.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Connects, authenticates and selects the database, then checks the
    /// server answers `PING`.
    pub async fn open(settings: &RedisSettings) -> Result<Self, RedisError> {
        let stream = tokio::time::timeout(
            settings.connect_timeout(),
            TcpStream::connect(&settings.addr),
        )
        .await
        .map_err(|_| RedisError::Timeout(settings.addr.clone()))?
        .map_err(|source| RedisError::Connect {
            addr: settings.addr.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;

        let mut conn = Connection::new(stream);

        if let Some(password) = &settings.password {
            conn.request(&Frame::command(["AUTH".to_string(), password.clone()]))
                .await?;
        }
        if settings.db != 0 {
            conn.request(&Frame::command(["SELECT".to_string(), settings.db.to_string()]))
                .await?;
        }
        match conn.request(&Frame::command(["PING"])).await? {
            Frame::Simple(pong) if pong == "PONG" => {}
            other => return Err(RedisError::UnexpectedReply(format!("{other:?}"))),
        }

        debug!(addr = %settings.addr, "redis connection established");
        Ok(conn)
    }

    /// Reads one frame. `None` means the server closed the connection cleanly.
    ///
    /// Cancel safe: a partially received frame stays in the buffer.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, RedisError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(RedisError::ConnectionClosed);
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), RedisError> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a command and waits for its reply. Error replies become
    /// [`RedisError::Server`].
    pub async fn request(&mut self, frame: &Frame) -> Result<Frame, RedisError> {
        self.write_frame(frame).await?;
        match self.read_frame().await? {
            Some(Frame::Error(message)) => Err(RedisError::Server(message)),
            Some(reply) => Ok(reply),
            None => Err(RedisError::ConnectionClosed),
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, RedisError> {
        let mut cursor = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut cursor) {
            Ok(()) => {
                let len = cursor.position() as usize;
                cursor.set_position(0);
                let frame = Frame::parse(&mut cursor)?;
                let _ = self.buffer.split_to(len);
                Ok(Some(frame))
            }
            Err(ProtocolError::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
