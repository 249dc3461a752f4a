//! Tests for payload encoding.

use super::*;

// ============================================================================
// SleepPayload Tests
// ============================================================================

mod sleep_payload {
    use super::*;

    /// Verify that surrounding whitespace is ignored.
    #[test]
    fn test_decode_trims_whitespace() {
        let payload = SleepPayload::decode("  3\n").unwrap();

        assert_eq!(payload.seconds(), 3);
        assert_eq!(payload.duration(), Duration::from_secs(3));
    }

    /// Verify that encoding and decoding agree for representative values.
    #[test]
    fn test_round_trip() {
        for seconds in [0, 1, 30, u64::MAX] {
            let payload = SleepPayload::from_secs(seconds);

            let decoded = SleepPayload::decode(&payload.encode().unwrap()).unwrap();

            assert_eq!(decoded, payload);
        }
    }

    /// Verify that non-numeric, negative and empty text is malformed.
    #[test]
    fn test_decode_rejects_invalid_text() {
        for text in ["abc", "-1", "", "   ", "1.5", "3 seconds"] {
            let result = SleepPayload::decode(text);

            assert!(
                matches!(result, Err(CodecError::MalformedPayload { .. })),
                "expected '{}' to be malformed, got {:?}",
                text,
                result
            );
        }
    }

    /// Verify that the error keeps the original text.
    #[test]
    fn test_malformed_error_carries_text() {
        let error = SleepPayload::decode("abc").unwrap_err();

        assert!(error.to_string().contains("'abc'"));
    }

    #[test]
    fn test_from_str() {
        let payload: SleepPayload = "42".parse().unwrap();

        assert_eq!(payload, SleepPayload::from_secs(42));
        assert_eq!(payload.to_string(), "42");
    }
}

// ============================================================================
// WorkItem Tests
// ============================================================================

mod work_item {
    use super::*;

    /// Verify that arbitrary text passes through untouched.
    #[test]
    fn test_round_trip_preserves_text() {
        let item = WorkItem::new(" résumé <xml> & spaces ");

        let decoded = WorkItem::decode(&item.encode().unwrap()).unwrap();

        assert_eq!(decoded, item);
    }

    /// Verify that text beyond the transport limit cannot be encoded.
    #[test]
    fn test_encode_rejects_oversized_text() {
        let item = WorkItem::new("x".repeat(MAX_PAYLOAD_BYTES + 1));

        let error = item.encode().unwrap_err();

        assert_eq!(
            error,
            CodecError::PayloadTooLarge {
                size: MAX_PAYLOAD_BYTES + 1,
                max_size: MAX_PAYLOAD_BYTES,
            }
        );
    }

    #[test]
    fn test_encode_accepts_text_at_limit() {
        let item = WorkItem::new("x".repeat(MAX_PAYLOAD_BYTES));

        assert!(item.encode().is_ok());
    }

    #[test]
    fn test_from_sleep_payload() {
        let item = WorkItem::from(SleepPayload::from_secs(3));

        assert_eq!(item.as_str(), "3");
    }
}
