use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode the bencode buffer, it is truncated or malformed")]
    BencodeIncomplete,

    #[error("Tried to read a bencode value with the wrong type")]
    BencodeTypeMismatch,

    #[error("The bencode dictionary does not have the key `{0}`")]
    BencodeKeyNotFound(String),

    #[error("The bencode list does not have the index `{0}`")]
    BencodeIndexNotFound(usize),

    #[error("The raw bytes of this bencode value were not captured")]
    BencodeRawNotCaptured,

    #[error("Error when reading magnet link")]
    MagnetLinkInvalid,

    #[error(
        "Your magnet does not have an info_hash, are you sure you copied \
         the entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error(
        "Your magnet does not have a tracker. This client does not support \
         DHT, you need a magnet that has at least one tracker."
    )]
    MagnetNoTracker,

    #[error("The tracker URI `{0}` could not be parsed")]
    TrackerUriInvalid(String),

    #[error("Could not connect to any tracker, all trackers were rejected")]
    TrackerNoHosts,

    #[error("Could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("Tracker resolved to no usable addresses")]
    TrackerSocketAddr,

    #[error("Failed to send a packet to the tracker")]
    TrackerSendFailed,

    #[error("The tracker took too long to respond")]
    TrackerTimeout,

    #[error(
        "The response received from the tracker is shorter than the \
         fixed packet layout"
    )]
    TrackerShortRead,

    #[error("The tracker answered with a transaction_id that is not ours")]
    TrackerTransactionMismatch,

    #[error("The tracker answered with the wrong action")]
    TrackerActionMismatch,

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("HTTP tracker error: {0}")]
    TrackerHttp(#[from] reqwest::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took too long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The response received from the peer is wrong")]
    MessageResponse,

    #[error("The worker could not engage its isolation boundary")]
    IsolationSetupFailed,

    #[error("Could not send a message over the worker channel")]
    IpcChannelClosed,

    #[error("Received an IPC message with an unknown type")]
    IpcUnknownMessage,

    #[error("No peers in the torrent")]
    NoPeers,

    #[error("String is not UTF-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exists"
    )]
    FolderOpenError(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you \
         have a $HOME env and that this program has permission to read it."
    )]
    HomeInvalid,

    #[error(
        "Error while trying to read the configuration file, please make \
         sure it has the correct format"
    )]
    ConfigDeserializeError,
}
