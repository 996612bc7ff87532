//! Integration tests for QPACK encoder/decoder.
//! Tests full workflow including dynamic table, encoder/decoder streams.

use bytes::Bytes;
use proptest::prelude::*;
use qpack_core::{
    DecodedHeaders, Error, FieldLine, HeadersSlot, HuffmanEncoding, MemoryStream, QpackConfig,
    QpackDecodedHeadersAccumulator, QpackDecoder, QpackEncoder, QpackSendStream, QpackStreamType,
};

/// An encoder and the peer decoder, connected by in-memory streams.
struct Connection {
    encoder: QpackEncoder,
    decoder: QpackDecoder,
    encoder_stream: MemoryStream,
    decoder_stream: MemoryStream,
    max_header_list_size: u64,
}

impl Connection {
    fn new(config: QpackConfig) -> Self {
        let encoder_stream = MemoryStream::new();
        let decoder_stream = MemoryStream::new();

        let mut encoder = QpackEncoder::new(&config);
        encoder.set_encoder_stream_delegate(Box::new(encoder_stream.clone()));
        assert!(encoder.set_maximum_dynamic_table_capacity(config.maximum_dynamic_table_capacity));
        encoder
            .set_dynamic_table_capacity(config.maximum_dynamic_table_capacity)
            .unwrap();
        assert!(encoder.set_maximum_blocked_streams(config.maximum_blocked_streams));

        let mut decoder = QpackDecoder::new(&config).unwrap();
        decoder.set_decoder_stream_delegate(Box::new(decoder_stream.clone()));

        Self {
            encoder,
            decoder,
            encoder_stream,
            decoder_stream,
            max_header_list_size: config.max_header_list_size,
        }
    }

    fn deliver_encoder_stream(&mut self) {
        let data = self.encoder_stream.take();
        self.decoder.decode_encoder_stream_data(&data).unwrap();
    }

    fn deliver_decoder_stream(&mut self) {
        self.decoder.flush_decoder_stream();
        let data = self.decoder_stream.take();
        self.encoder.decode_decoder_stream_data(&data).unwrap();
    }

    fn start_decoding(&mut self, stream_id: u64, header_block: &[u8]) -> HeadersSlot {
        let slot = HeadersSlot::new();
        self.decoder
            .create_progressive_decoder(
                stream_id,
                Box::new(QpackDecodedHeadersAccumulator::new(slot.clone(), self.max_header_list_size)),
            )
            .unwrap();
        self.decoder.decode(stream_id, header_block).unwrap();
        self.decoder.end_header_block(stream_id).unwrap();
        slot
    }

    /// Encodes, delivers the encoder stream, decodes and acknowledges.
    fn round_trip(&mut self, stream_id: u64, headers: &[FieldLine]) -> DecodedHeaders {
        let header_block = self.encoder.encode_header_list(stream_id, headers);
        self.deliver_encoder_stream();
        let slot = self.start_decoding(stream_id, &header_block);
        self.deliver_decoder_stream();
        slot.take().unwrap().unwrap()
    }
}

fn config() -> QpackConfig {
    QpackConfig::default()
}

fn field(name: &str, value: &str) -> FieldLine {
    FieldLine::new(name.to_string(), value.to_string())
}

#[test]
fn test_encode_decode_static_headers() {
    let mut connection = Connection::new(config());
    let headers = vec![field(":method", "GET"), field(":scheme", "https"), field(":path", "/")];

    let header_block = connection.encoder.encode_header_list(0, &headers);
    // All three are exact static matches.
    assert_eq!(&header_block[..], &[0x00, 0x00, 0xd1, 0xd7, 0xc1]);
    // Only Set Dynamic Table Capacity 4096.
    assert_eq!(&connection.encoder_stream.take()[..], &[0x3f, 0xe1, 0x1f]);

    let decoded = connection.start_decoding(0, &header_block).take().unwrap().unwrap();
    assert_eq!(decoded.fields, headers);
}

#[test]
fn test_encode_decode_with_dynamic_table() {
    let mut connection = Connection::new(config());
    let headers = vec![
        field(":method", "GET"),
        field(":authority", "example.com"),
        field("x-request-id", "abc123"),
    ];

    let decoded = connection.round_trip(0, &headers);
    assert_eq!(decoded.fields, headers);
    assert_eq!(connection.decoder.header_table().inserted_entry_count(), 2);
    assert_eq!(connection.encoder.blocking_manager().known_received_count(), 2);

    // The second request only refers to entries.
    let header_block = connection.encoder.encode_header_list(4, &headers);
    assert!(connection.encoder_stream.is_empty());
    assert_eq!(header_block.len(), 5);
    let decoded = connection.start_decoding(4, &header_block).take().unwrap().unwrap();
    assert_eq!(decoded.fields, headers);
}

#[test]
fn test_response_headers_with_explicit_instructions() {
    let mut decoder = QpackDecoder::new(&QpackConfig {
        maximum_dynamic_table_capacity: 220,
        ..Default::default()
    })
    .unwrap();
    let decoder_stream = MemoryStream::new();
    decoder.set_decoder_stream_delegate(Box::new(decoder_stream.clone()));

    // Capacity 220, then `:status: 200` and `content-type: text/html`
    // inserted with static name references 24 and 44.
    let mut encoder_stream = vec![0x3f, 0xbd, 0x01, 0xd8, 0x03];
    encoder_stream.extend_from_slice(b"200");
    encoder_stream.extend_from_slice(&[0xec, 0x09]);
    encoder_stream.extend_from_slice(b"text/html");
    decoder.decode_encoder_stream_data(&encoder_stream).unwrap();

    // Required Insert Count 2, Base 2, relative indices 1 and 0.
    let slot = HeadersSlot::new();
    decoder
        .create_progressive_decoder(0, Box::new(QpackDecodedHeadersAccumulator::new(slot.clone(), 1024)))
        .unwrap();
    decoder.decode(0, &[0x03, 0x00, 0x81, 0x80]).unwrap();
    decoder.end_header_block(0).unwrap();

    let decoded = slot.take().unwrap().unwrap();
    assert_eq!(decoded.fields, vec![field(":status", "200"), field("content-type", "text/html")]);
    decoder.flush_decoder_stream();
    assert_eq!(&decoder_stream.take()[..], &[0x80]);
}

#[test]
fn test_blocked_until_encoder_stream_arrives() {
    let mut connection = Connection::new(config());
    let headers = vec![field("x-trace", "1"), field("x-span", "2")];

    let header_block = connection.encoder.encode_header_list(0, &headers);
    assert!(connection.encoder.blocking_manager().is_stream_blocked(0));

    // Header block overtakes the encoder stream.
    let slot = connection.start_decoding(0, &header_block);
    assert!(!slot.is_ready());
    assert_eq!(connection.decoder.blocked_stream_count(), 1);

    connection.deliver_encoder_stream();
    assert_eq!(slot.take().unwrap().unwrap().fields, headers);
    assert_eq!(connection.decoder.blocked_stream_count(), 0);

    connection.deliver_decoder_stream();
    assert!(!connection.encoder.blocking_manager().is_stream_blocked(0));
}

#[test]
fn test_dynamic_table_eviction() {
    let mut connection = Connection::new(QpackConfig {
        maximum_dynamic_table_capacity: 100,
        ..Default::default()
    });

    for i in 0..20u64 {
        let headers = vec![field(&format!("x-header-{}", i), &format!("value-{}", i))];
        let decoded = connection.round_trip(i * 4, &headers);
        assert_eq!(decoded.fields, headers);
    }
    let table = connection.decoder.header_table().base();
    assert!(table.dropped_entry_count() > 0);
    assert!(table.dynamic_table_size() <= 100);
}

#[test]
fn test_multiple_streams() {
    let mut connection = Connection::new(config());
    let requests: Vec<Vec<FieldLine>> = (0..5)
        .map(|i| {
            vec![
                field(":method", "POST"),
                field(":path", &format!("/upload/{}", i)),
                field("x-client", "integration"),
            ]
        })
        .collect();

    let header_blocks: Vec<Bytes> = requests
        .iter()
        .enumerate()
        .map(|(i, headers)| connection.encoder.encode_header_list(i as u64 * 4, headers))
        .collect();
    connection.deliver_encoder_stream();

    // Decode in reverse order.
    for (i, header_block) in header_blocks.iter().enumerate().rev() {
        let slot = connection.start_decoding(i as u64 * 4, header_block);
        assert_eq!(slot.take().unwrap().unwrap().fields, requests[i]);
    }
    connection.deliver_decoder_stream();
    assert_eq!(connection.encoder.blocking_manager().blocked_stream_count(), 0);
}

#[test]
fn test_stream_cancellation() {
    let mut connection = Connection::new(config());
    let header_block = connection
        .encoder
        .encode_header_list(4, &[field("x-cancelled", "yes")]);
    assert!(connection.encoder.blocking_manager().is_stream_blocked(4));

    let slot = connection.start_decoding(4, &header_block);
    connection.decoder.on_stream_reset(4);
    assert!(!connection.decoder.has_decoder(4));
    connection.deliver_decoder_stream();
    assert!(!connection.encoder.blocking_manager().is_stream_blocked(4));
    assert_eq!(connection.encoder.blocking_manager().outstanding_header_blocks(4), 0);

    // The insert still arrives and is reported.
    connection.deliver_encoder_stream();
    assert!(!slot.is_ready());
    let decoded = connection.round_trip(8, &[field(":method", "GET")]);
    assert_eq!(decoded.fields.len(), 1);
    assert_eq!(connection.encoder.blocking_manager().known_received_count(), 1);
}

#[test]
fn test_large_header_set() {
    let mut connection = Connection::new(QpackConfig {
        maximum_dynamic_table_capacity: 16 * 1024,
        ..Default::default()
    });
    let headers: Vec<FieldLine> = (0..100)
        .map(|i| field(&format!("x-custom-header-{}", i), &"v".repeat(i)))
        .collect();
    let decoded = connection.round_trip(0, &headers);
    assert_eq!(decoded.fields, headers);
    assert!(!decoded.header_list_size_limit_exceeded);
}

#[test]
fn test_huffman_disabled_roundtrip() {
    let mut connection = Connection::new(QpackConfig {
        huffman_encoding: HuffmanEncoding::Disabled,
        ..Default::default()
    });
    let headers = vec![field("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")];
    let header_block = connection.encoder.encode_header_list(0, &headers);
    let encoder_stream = connection.encoder_stream.take();
    // The value appears verbatim on the encoder stream.
    assert!(encoder_stream
        .windows(headers[0].value.len())
        .any(|window| window == &headers[0].value[..]));

    connection.decoder.decode_encoder_stream_data(&encoder_stream).unwrap();
    let decoded = connection.start_decoding(0, &header_block).take().unwrap().unwrap();
    assert_eq!(decoded.fields, headers);
}

#[test]
fn test_cookie_crumbs_decoded_separately() {
    let mut connection = Connection::new(config());
    let decoded = connection.round_trip(0, &[field("cookie", "a=1; b=2; c=3")]);
    assert_eq!(
        decoded.fields,
        vec![field("cookie", "a=1"), field("cookie", "b=2"), field("cookie", "c=3")]
    );
}

#[test]
fn test_header_list_size_limit() {
    let mut connection = Connection::new(QpackConfig {
        max_header_list_size: 100,
        ..Default::default()
    });
    let headers = vec![field("x-a", &"a".repeat(40)), field("x-b", &"b".repeat(40))];
    let decoded = connection.round_trip(0, &headers);
    assert!(decoded.header_list_size_limit_exceeded);
    assert_eq!(decoded.uncompressed_header_bytes_without_overhead, 86);
}

#[test]
fn test_empty_header_block() {
    let mut connection = Connection::new(config());
    let header_block = connection.encoder.encode_header_list(0, &[]);
    assert_eq!(&header_block[..], &[0x00, 0x00]);
    let decoded = connection.start_decoding(0, &header_block).take().unwrap().unwrap();
    assert!(decoded.fields.is_empty());
}

#[test]
fn test_low_memory_config() {
    let mut connection = Connection::new(QpackConfig::low_memory());
    let headers = vec![field(":method", "GET"), field("x-custom", "value")];
    let decoded = connection.round_trip(0, &headers);
    assert_eq!(decoded.fields, headers);
    assert_eq!(connection.decoder.header_table().inserted_entry_count(), 0);
    assert!(!connection.encoder.dynamic_table_entry_referenced());
}

#[test]
fn test_send_stream_types() {
    let encoder_transport = MemoryStream::new();
    let decoder_transport = MemoryStream::new();
    let config = config();

    let mut encoder = QpackEncoder::new(&config);
    encoder.set_encoder_stream_delegate(Box::new(QpackSendStream::new(
        QpackStreamType::Encoder,
        encoder_transport.clone(),
    )));
    assert!(encoder.set_maximum_dynamic_table_capacity(4096));
    encoder.set_dynamic_table_capacity(4096).unwrap();
    encoder.encode_header_list(0, &[]);
    let data = encoder_transport.take();
    assert_eq!(data[0], 0x02);

    let mut decoder = QpackDecoder::new(&config).unwrap();
    decoder.set_decoder_stream_delegate(Box::new(QpackSendStream::new(
        QpackStreamType::Decoder,
        decoder_transport.clone(),
    )));
    decoder.on_stream_reset(0);
    assert_eq!(&decoder_transport.take()[..], &[0x03, 0x40]);
    decoder.on_stream_reset(4);
    assert_eq!(&decoder_transport.take()[..], &[0x44]);
}

#[test]
fn test_malformed_header_block_is_stream_error() {
    let mut connection = Connection::new(config());
    let slot = connection.start_decoding(0, &[0x00, 0x00, 0xff, 0x24]);
    let error = slot.take().unwrap().unwrap_err();
    assert_eq!(error, Error::DecompressionFailed("Static table entry not found.".into()));
    assert_eq!(error.http3_error_code(), 0x0200);
    assert!(!error.is_connection_error());

    // The connection keeps working.
    let decoded = connection.round_trip(4, &[field(":method", "GET")]);
    assert_eq!(decoded.fields.len(), 1);
}

fn header_list() -> impl Strategy<Value = Vec<FieldLine>> {
    proptest::collection::vec(
        ("[a-z][a-z-]{0,15}", "[ -~]{0,40}").prop_map(|(name, value)| FieldLine::new(name, value)),
        0..12,
    )
}

proptest! {
    #[test]
    fn prop_round_trip(
        requests in proptest::collection::vec(header_list(), 1..6),
        chunk_size in 1usize..8,
        header_block_first in any::<bool>(),
    ) {
        let mut connection = Connection::new(QpackConfig {
            maximum_dynamic_table_capacity: 256,
            maximum_blocked_streams: 2,
            cookie_crumbling: false,
            ..Default::default()
        });

        for (i, headers) in requests.iter().enumerate() {
            let stream_id = i as u64 * 4;
            let header_block = connection.encoder.encode_header_list(stream_id, headers);
            if !header_block_first {
                connection.deliver_encoder_stream();
            }

            let slot = HeadersSlot::new();
            connection
                .decoder
                .create_progressive_decoder(
                    stream_id,
                    Box::new(QpackDecodedHeadersAccumulator::new(slot.clone(), u64::MAX)),
                )
                .unwrap();
            for chunk in header_block.chunks(chunk_size) {
                connection.decoder.decode(stream_id, chunk).unwrap();
            }
            connection.decoder.end_header_block(stream_id).unwrap();
            connection.deliver_encoder_stream();
            connection.deliver_decoder_stream();

            let decoded = slot.take().unwrap().unwrap();
            prop_assert_eq!(&decoded.fields, headers);
        }
        prop_assert_eq!(connection.decoder.blocked_stream_count(), 0);
        prop_assert_eq!(connection.encoder.blocking_manager().blocked_stream_count(), 0);
    }
}
