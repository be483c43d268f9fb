#[cfg(test)]
mod tests {
    use crate::{IpcError, Result};
    use std::error::Error;

    #[test]
    fn test_ipc_error_display() {
        let err = IpcError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed by peer");

        let err = IpcError::ReceiveFailed("connection reset".to_string());
        assert_eq!(err.to_string(), "Failed to receive: connection reset");

        let err = IpcError::ProtocolCorruption("unknown tag 0x7a".to_string());
        assert_eq!(err.to_string(), "Protocol corruption: unknown tag 0x7a");

        let err = IpcError::FrameTooLarge { len: 20, max: 10 };
        assert_eq!(
            err.to_string(),
            "Frame payload of 20 bytes exceeds maximum of 10 bytes"
        );

        let err = IpcError::DescriptorTransfer("no descriptor attached".to_string());
        assert_eq!(
            err.to_string(),
            "Descriptor transfer failed: no descriptor attached"
        );
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_success() -> Result<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }

        fn returns_failure() -> Result<Vec<u8>> {
            Err(IpcError::ReceiveFailed("reset by peer".to_string()))
        }

        assert!(returns_success().is_ok());
        assert!(returns_failure().is_err());
    }

    #[test]
    fn test_error_trait_implementation() {
        let err = IpcError::ProtocolCorruption("test".to_string());
        let _: &dyn Error = &err;
        assert!(err.source().is_none());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(IpcError::ConnectionClosed.code(), "IPC001");
        assert_eq!(IpcError::ReceiveFailed("test".to_string()).code(), "IPC002");
        assert_eq!(
            IpcError::ProtocolCorruption("test".to_string()).code(),
            "IPC003"
        );
        assert_eq!(IpcError::FrameTooLarge { len: 1, max: 0 }.code(), "IPC004");
        assert_eq!(
            IpcError::DescriptorTransfer("test".to_string()).code(),
            "IPC005"
        );
    }

    #[test]
    fn test_is_closed() {
        assert!(IpcError::ConnectionClosed.is_closed());
        assert!(IpcError::ReceiveFailed("eof".to_string()).is_closed());
        assert!(!IpcError::ProtocolCorruption("bad".to_string()).is_closed());
    }
}
