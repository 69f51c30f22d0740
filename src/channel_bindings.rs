/// Application data that ties a security context to the channel it was negotiated over.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelBindings {
    application_data: Box<[u8]>,
}
impl ChannelBindings {
    pub fn new(application_data: impl Into<Box<[u8]>>) -> Self {
        Self {
            application_data: application_data.into(),
        }
    }
    /// Bindings for `channel`, or `None` if the channel has none to offer.
    pub fn from_channel<C: Channel + ?Sized>(channel: &C) -> Result<Option<Self>, C::Error> {
        Ok(channel.channel_bindings()?.map(Self::new))
    }
    pub fn application_data(&self) -> &[u8] {
        &self.application_data
    }
}

pub trait Channel {
    type Error: std::error::Error;
    fn channel_bindings(&self) -> Result<Option<Vec<u8>>, Self::Error>;
}

/// `tls-server-end-point` bindings (RFC 5929).
#[cfg(feature = "native-tls")]
impl<S: std::io::Read + std::io::Write> Channel for native_tls::TlsStream<S> {
    type Error = native_tls::Error;

    fn channel_bindings(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.tls_server_end_point()?.map(|hash| {
            let mut data = b"tls-server-end-point:".to_vec();
            data.extend_from_slice(&hash);
            data
        }))
    }
}
