use std::{io, time::Duration};

use courier_core::{CoreError, ErrorCategory, codes};

/// 一次底层套接字操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为 [`CoreError`]，并按错误种类给出处置分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(kind.code, format!("{}: {}", kind.message, error)).with_category(category)
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(Some(Duration::from_millis(5)))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Retryable(Some(Duration::from_millis(50))),
        // 文件描述符耗尽等资源类错误，退避后通常能恢复。
        ErrorKind::OutOfMemory | ErrorKind::QuotaExceeded => {
            ErrorCategory::Retryable(Some(Duration::from_millis(100)))
        }
        _ => ErrorCategory::NonRetryable,
    }
}

/// 接入器装配与生命周期错误。
#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("max_connections must be greater than zero")]
    ZeroConnections,
    #[error("max_connections {0} exceeds the supported maximum")]
    TooManyConnections(usize),
    #[error("buffer_block_size must be greater than zero")]
    ZeroBlockSize,
    #[error("broker is already running on {0}")]
    AlreadyRunning(std::net::SocketAddr),
}

impl From<AcceptorError> for CoreError {
    fn from(err: AcceptorError) -> Self {
        let code = match err {
            AcceptorError::AlreadyRunning(_) => codes::TRANSPORT_ALREADY_STARTED,
            _ => codes::CONFIG_INVALID,
        };
        CoreError::new(code, err.to_string()).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::ErrorKind;

    #[test]
    fn io_errors_keep_operation_code_and_category() {
        let err = map_io_error(
            ACCEPT,
            io::Error::new(io::ErrorKind::ConnectionAborted, "peer went away"),
        );
        assert_eq!(err.code(), ACCEPT.code);
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert!(err.category().is_retryable());
        assert!(err.message().contains("peer went away"));

        let denied = map_io_error(BIND, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.category(), ErrorCategory::NonRetryable);
    }

    #[test]
    fn acceptor_errors_map_to_stable_codes() {
        let config: CoreError = AcceptorError::ZeroBlockSize.into();
        assert_eq!(config.code(), codes::CONFIG_INVALID);
        assert_eq!(config.kind(), ErrorKind::Configuration);

        let running: CoreError =
            AcceptorError::AlreadyRunning(([127, 0, 0, 1], 5672).into()).into();
        assert_eq!(running.code(), codes::TRANSPORT_ALREADY_STARTED);
    }
}
