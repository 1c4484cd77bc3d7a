use crate::error::ChannelError;
use futures::{Sink, Stream};
use std::{future::Future, pin::Pin};

/// A boxed, thread-safe future.
pub type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The text frames received on a connection.
pub type FrameStream =
    Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Where text frames are written to a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;

/// Opens connections for a [`LiveChannel`](crate::LiveChannel).
///
/// This is implemented for
/// [`TungsteniteConnector`](crate::tungstenite::TungsteniteConnector). Tests
/// can implement it over in-memory channels.
pub trait Connector: Send + Sync + 'static {
    /// Opens a connection to `url`.
    fn connect(
        &self,
        url: &str,
    ) -> PinnedFuture<Result<(FrameStream, FrameSink), ChannelError>>;
}

#[cfg(feature = "tungstenite")]
/// Implements [`Connector`] with [`tokio_tungstenite`].
pub mod tungstenite {
    use super::{Connector, FrameSink, FrameStream, PinnedFuture};
    use crate::error::ChannelError;
    use futures::{future, SinkExt, StreamExt, TryStreamExt};
    use tokio_tungstenite::tungstenite::Message;

    /// Opens websocket connections.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TungsteniteConnector;

    impl Connector for TungsteniteConnector {
        fn connect(
            &self,
            url: &str,
        ) -> PinnedFuture<Result<(FrameStream, FrameSink), ChannelError>>
        {
            let url = url.to_string();
            Box::pin(async move {
                let (socket, _) = tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(|e| ChannelError::Transport(e.to_string()))?;
                let (sink, stream) = socket.split();

                // only text frames carry protocol messages
                let stream = stream
                    .map_err(|e| ChannelError::Transport(e.to_string()))
                    .try_filter_map(|msg| {
                        future::ready(Ok(match msg {
                            Message::Text(text) => {
                                Some(text.as_str().to_owned())
                            }
                            Message::Close(frame) => {
                                tracing::debug!(?frame, "server closed");
                                None
                            }
                            _ => None,
                        }))
                    });
                let sink = sink
                    .sink_map_err(|e| ChannelError::Transport(e.to_string()))
                    .with(|text: String| {
                        future::ready(Ok::<_, ChannelError>(Message::text(
                            text,
                        )))
                    });

                Ok((
                    Box::pin(stream) as FrameStream,
                    Box::pin(sink) as FrameSink,
                ))
            })
        }
    }
}
