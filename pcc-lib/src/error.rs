use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
    Config(String),
    PlyParse(String),
    EmptyInput,
    Compress(String),
    StreamCorruption(String),
    EmptyResult,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => {
                write!(f, "Inconsistent parameter set: {}", e)
            }
            Error::PlyParse(e) => {
                write!(f, "Failed to parse the point cloud file: {}", e)
            }
            Error::EmptyInput => {
                write!(f, "The input point cloud is empty.")
            }
            Error::Compress(e) => {
                write!(f, "Failed to compress a payload unit: {}", e)
            }
            Error::StreamCorruption(e) => {
                write!(f, "Corrupt payload stream: {}", e)
            }
            Error::EmptyResult => {
                write!(f, "Decoding produced no reconstructed points.")
            }
            Error::Io(e) => {
                write!(f, "An I/O error occurred: {}", e)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}
