//! Wire format of the angle stream (tracking process → stimulus process).
//!
//! Each message is one bincode-encoded [`AngleSample`] behind a 4-byte
//! big-endian length prefix. Self-contained: no imports from other
//! minizf modules.

use bytes::Bytes;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AngleSample {
    /// Monotonic capture time of the frame the angle came from
    pub timestamp: f64,
    /// `angles[-1] - angles[0]` of the tracked tail
    pub delta_angle: f64,
}

const MAX_FRAME_LENGTH: usize = 64 * 1024;

pub type SampleStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Length-delimited framing shared by both ends.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Create a framed sample stream with length-delimited framing.
pub fn sample_stream(stream: TcpStream) -> SampleStream {
    Framed::new(stream, codec())
}

/// Send one sample (bincode + length prefix) and flush it.
pub async fn send_sample(stream: &mut SampleStream, sample: &AngleSample) -> anyhow::Result<()> {
    let data = bincode::serialize(sample)?;
    stream.send(Bytes::from(data)).await?;
    Ok(())
}

/// Flush and shut down the write half.
pub async fn shutdown(stream: &mut SampleStream) -> anyhow::Result<()> {
    SinkExt::<Bytes>::close(stream).await?;
    Ok(())
}

/// Deserialize the payload of one received frame.
pub fn decode_sample(frame: &[u8]) -> anyhow::Result<AngleSample> {
    Ok(bincode::deserialize(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use futures::StreamExt;
    use tokio_util::codec::{Decoder, Encoder};

    fn sample(t: f64) -> AngleSample {
        AngleSample {
            timestamp: t,
            delta_angle: -0.25 * t,
        }
    }

    fn encode(sample: &AngleSample, dst: &mut BytesMut) {
        let data = bincode::serialize(sample).unwrap();
        codec().encode(Bytes::from(data), dst).unwrap();
    }

    #[test]
    fn test_many_samples_in_one_read() {
        let mut wire = BytesMut::new();
        for i in 0..5 {
            encode(&sample(i as f64), &mut wire);
        }
        let mut decoder = codec();
        for i in 0..5 {
            let frame = decoder.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decode_sample(&frame).unwrap(), sample(i as f64));
        }
        assert!(decoder.decode(&mut wire).unwrap().is_none());
        assert!(wire.is_empty());
    }

    #[test]
    fn test_frame_is_length_prefixed() {
        let mut wire = BytesMut::new();
        encode(&sample(0.0), &mut wire);
        // f64 2 個 = 16 バイト
        assert_eq!(&wire[..4], &16u32.to_be_bytes());
        assert_eq!(wire.len(), 4 + 16);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&(MAX_FRAME_LENGTH as u32 + 1).to_be_bytes());
        assert!(codec().decode(&mut wire).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        assert!(decode_sample(&[0u8; 7]).is_err());
    }

    #[tokio::test]
    async fn test_framed_round_trip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = sample_stream(TcpStream::connect(addr).await.unwrap());
            for i in 0..3 {
                send_sample(&mut stream, &sample(i as f64)).await.unwrap();
            }
        });
        let (socket, _) = listener.accept().await.unwrap();
        let mut stream = sample_stream(socket);
        let mut got = Vec::new();
        while let Some(frame) = stream.next().await {
            got.push(decode_sample(&frame.unwrap()).unwrap());
        }
        client.await.unwrap();
        assert_eq!(got, vec![sample(0.0), sample(1.0), sample(2.0)]);
    }
}
