//! The server-side counterpart of the client's token issuer: given the bytes of an
//! OpenSecureChannel request, install the new token on the channel and produce the bytes of
//! the matching response. Interpreting those bytes (requested lifetime, security mode,
//! client nonce) is the data-model layer's job; this trait is the seam between it and the
//! transport.

use async_trait::async_trait;

use opcua_transport_core::SecureChannel;
use opcua_transport_types::Error;

#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Handle one OpenSecureChannel request body on a freshly accepted (or renewing)
    /// channel: install a token via `secure_channel.set_security_token`, and return the
    /// encoded response body to send back.
    async fn open(
        &self,
        secure_channel: &mut SecureChannel,
        request_body: &[u8],
    ) -> Result<Vec<u8>, Error>;
}
