use serde::Deserialize;

/// Envelope of an Alpaca management API response.
#[derive(Debug, Deserialize)]
pub(crate) struct ValueResponse<T> {
    #[serde(rename = "Value")]
    value: Option<T>,
    #[serde(rename = "ErrorNumber", default)]
    error_number: u16,
    #[serde(rename = "ErrorMessage", default)]
    error_message: String,
    #[serde(rename = "ClientTransactionID", default)]
    pub(crate) client_transaction_id: Option<u32>,
    #[serde(rename = "ServerTransactionID", default)]
    pub(crate) server_transaction_id: Option<u32>,
}

impl<T> ValueResponse<T> {
    pub(crate) fn into_result(self) -> eyre::Result<T> {
        eyre::ensure!(
            self.error_number == 0,
            "ASCOM error {code:#X}: {message}",
            code = self.error_number,
            message = self.error_message,
        );
        self.value
            .ok_or_else(|| eyre::eyre!("Response is missing the Value field"))
    }
}
