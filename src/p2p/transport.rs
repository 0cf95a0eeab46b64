//! Framed TCP transport and the EIP-191 challenge-response handshake (§4.6).

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::chain::ChainAdapter;
use crate::error::{Error, Result};
use crate::p2p::messages::{Envelope, HANDSHAKE_VERSION};
use crate::utils::timeout::{TimeoutExt, Timeouts};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
const CHALLENGE_LEN: usize = 32;

/// Write one length-prefixed JSON frame.
pub async fn write_envelope(stream: &mut TcpStream, envelope: &Envelope) -> Result<()> {
    let body = serde_json::to_vec(envelope)?;
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await.map_err(Error::Io)?;
    stream.write_all(&body).await.map_err(Error::Io)?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_envelope(stream: &mut TcpStream) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(Error::Io)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::P2p(format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.map_err(Error::Io)?;
    serde_json::from_slice(&body).map_err(Error::from)
}

fn challenge_message(version: u8, challenge: &[u8; CHALLENGE_LEN], security: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(1 + CHALLENGE_LEN + security.len());
    message.push(version);
    message.extend_from_slice(challenge);
    message.extend_from_slice(security);
    message
}

/// Client side of the handshake: send our challenge, verify the peer's
/// response recovers to a current federator, then answer the peer's own
/// challenge (§4.6).
pub async fn client_handshake(
    stream: &mut TcpStream,
    chain: &dyn ChainAdapter,
    security: &[u8],
    timeouts: &Timeouts,
) -> Result<ethers::types::Address> {
    let mut client_challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut client_challenge);
    stream.write_u8(HANDSHAKE_VERSION).await.map_err(Error::Io)?;
    stream.write_all(&client_challenge).await.map_err(Error::Io)?;

    let version = stream
        .read_u8()
        .with_timeout(timeouts.p2p_handshake)
        .await
        .map_err(|_| Error::P2p("handshake timed out waiting for server version".into()))?
        .map_err(Error::Io)?;
    if version != HANDSHAKE_VERSION {
        return Err(Error::P2p(format!("unsupported handshake version {version}")));
    }
    let mut server_challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut server_challenge).await.map_err(Error::Io)?;

    let mut sig_len_buf = [0u8; 2];
    stream.read_exact(&mut sig_len_buf).await.map_err(Error::Io)?;
    let sig_len = u16::from_be_bytes(sig_len_buf) as usize;
    let mut sig_bytes = vec![0u8; sig_len];
    stream.read_exact(&mut sig_bytes).await.map_err(Error::Io)?;
    let server_signature: ethers::types::Signature = hex::encode(&sig_bytes)
        .parse()
        .map_err(|e| Error::P2p(format!("invalid server handshake signature: {e}")))?;

    let server_message = challenge_message(HANDSHAKE_VERSION, &client_challenge, security);
    let server_address = chain.recover(&server_message, &server_signature)?;
    let federators = chain.federators().await?;
    if !federators.contains(&server_address) {
        return Err(Error::P2p(format!("handshake peer {server_address:#x} is not a current federator")));
    }

    let client_message = challenge_message(HANDSHAKE_VERSION, &server_challenge, security);
    let client_signature = chain.sign_message(&client_message).await?;
    let sig_bytes = client_signature.to_vec();
    stream.write_all(&(sig_bytes.len() as u16).to_be_bytes()).await.map_err(Error::Io)?;
    stream.write_all(&sig_bytes).await.map_err(Error::Io)?;

    Ok(server_address)
}

/// Server side of the handshake, symmetric to [`client_handshake`] (§4.6).
pub async fn server_handshake(
    stream: &mut TcpStream,
    chain: &dyn ChainAdapter,
    security: &[u8],
    timeouts: &Timeouts,
) -> Result<ethers::types::Address> {
    let version = stream
        .read_u8()
        .with_timeout(timeouts.p2p_handshake)
        .await
        .map_err(|_| Error::P2p("handshake timed out waiting for client version".into()))?
        .map_err(Error::Io)?;
    if version != HANDSHAKE_VERSION {
        return Err(Error::P2p(format!("unsupported handshake version {version}")));
    }
    let mut client_challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut client_challenge).await.map_err(Error::Io)?;

    let mut server_challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut server_challenge);
    let server_message = challenge_message(HANDSHAKE_VERSION, &client_challenge, security);
    let server_signature = chain.sign_message(&server_message).await?;
    let sig_bytes = server_signature.to_vec();

    stream.write_u8(HANDSHAKE_VERSION).await.map_err(Error::Io)?;
    stream.write_all(&server_challenge).await.map_err(Error::Io)?;
    stream.write_all(&(sig_bytes.len() as u16).to_be_bytes()).await.map_err(Error::Io)?;
    stream.write_all(&sig_bytes).await.map_err(Error::Io)?;

    let mut sig_len_buf = [0u8; 2];
    stream.read_exact(&mut sig_len_buf).await.map_err(Error::Io)?;
    let sig_len = u16::from_be_bytes(sig_len_buf) as usize;
    let mut client_sig_bytes = vec![0u8; sig_len];
    stream.read_exact(&mut client_sig_bytes).await.map_err(Error::Io)?;
    let client_signature: ethers::types::Signature = hex::encode(&client_sig_bytes)
        .parse()
        .map_err(|e| Error::P2p(format!("invalid client handshake signature: {e}")))?;

    let client_message = challenge_message(HANDSHAKE_VERSION, &server_challenge, security);
    let client_address = chain.recover(&client_message, &client_signature)?;
    let federators = chain.federators().await?;
    if !federators.contains(&client_address) {
        return Err(Error::P2p(format!("handshake peer {client_address:#x} is not a current federator")));
    }

    Ok(client_address)
}
