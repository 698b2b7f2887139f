use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::codec::{FrameCodec, ProtocolError};
use crate::frame::{CommandFrame, Frame};
use crate::Error;

pub struct Connection {
    pub id: Uuid,
    pub client_address: SocketAddr,
    // Data is read from the socket into the codec's read buffer. Bytes of a frame are removed
    // from it only once the whole frame has been decoded, so a partial frame survives across
    // reads.
    framed: Framed<TcpStream, FrameCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream, client_address: SocketAddr, codec: FrameCodec) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            client_address,
            framed: Framed::new(stream, codec),
        }
    }

    /// Reads the next command from the client.
    ///
    /// Returns `None` once the client closes the connection; a trailing partial frame is
    /// discarded at that point. A malformed frame is returned as `Some(Err(_))` and the
    /// connection stays usable.
    pub async fn read_frame(
        &mut self,
    ) -> Result<Option<Result<CommandFrame, ProtocolError>>, Error> {
        self.framed.next().await.transpose()
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.framed.send(frame).await
    }
}
