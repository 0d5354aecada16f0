use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("track `{0}` not found in this session")]
    UnknownTrack(String),
    #[error("`--ts` must be a number, got `{0}`")]
    InvalidTimestamp(String),
}
