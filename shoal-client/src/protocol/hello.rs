//! HELLO feature negotiation values.

/// Features the client may advertise in HELLO. The session's effective set
/// is the intersection of what we send and what the server echoes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HelloFeature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNodelay = 0x03,
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Snappy = 0x0a,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
    AltRequestSupport = 0x10,
    SyncReplication = 0x11,
    Collections = 0x12,
    PreserveTtl = 0x14,
    Vattr = 0x15,
}

impl HelloFeature {
    pub fn parse(raw: u16) -> Option<HelloFeature> {
        Some(match raw {
            0x01 => HelloFeature::Datatype,
            0x02 => HelloFeature::Tls,
            0x03 => HelloFeature::TcpNodelay,
            0x04 => HelloFeature::MutationSeqno,
            0x06 => HelloFeature::Xattr,
            0x07 => HelloFeature::Xerror,
            0x08 => HelloFeature::SelectBucket,
            0x0a => HelloFeature::Snappy,
            0x0b => HelloFeature::Json,
            0x0c => HelloFeature::Duplex,
            0x0d => HelloFeature::ClustermapChangeNotification,
            0x0e => HelloFeature::UnorderedExecution,
            0x0f => HelloFeature::Tracing,
            0x10 => HelloFeature::AltRequestSupport,
            0x11 => HelloFeature::SyncReplication,
            0x12 => HelloFeature::Collections,
            0x14 => HelloFeature::PreserveTtl,
            0x15 => HelloFeature::Vattr,
            _ => return None,
        })
    }

    /// The default advertisement, in the order they go on the wire.
    pub fn requested() -> Vec<HelloFeature> {
        vec![
            HelloFeature::TcpNodelay,
            HelloFeature::MutationSeqno,
            HelloFeature::Xattr,
            HelloFeature::Xerror,
            HelloFeature::SelectBucket,
            HelloFeature::Snappy,
            HelloFeature::Json,
            HelloFeature::Duplex,
            HelloFeature::ClustermapChangeNotification,
            HelloFeature::UnorderedExecution,
            HelloFeature::Tracing,
            HelloFeature::AltRequestSupport,
            HelloFeature::SyncReplication,
            HelloFeature::Collections,
            HelloFeature::PreserveTtl,
            HelloFeature::Vattr,
        ]
    }
}
