use thiserror::Error;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("offer already created for this session")]
    OfferAlreadyCreated,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
