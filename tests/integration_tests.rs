//! Integration Tests for Xeus Modbus
//!
//! Drives the full stack (profiles, reader, client, codec) against a simulated
//! instrument, both in-memory and behind a real TCP listener.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use xeus_modbus::profiles::{read_ir, read_ir_raw, read_nmr, read_pxe, IR_LAYOUT};
use xeus_modbus::protocol::{build_exception_response, build_read_response, crc16};
use xeus_modbus::utils::logging::init_test_logger;
use xeus_modbus::*;

/// Register table with the instrument's quirks
#[derive(Default)]
struct SimulatedInstrument {
    registers: HashMap<u16, u16>,
    /// Addresses answered with "illegal data address"
    unavailable: Vec<Range<u16>>,
    /// Addresses answered with the given exception code
    faults: Vec<(Range<u16>, u8)>,
    /// Start addresses the firmware refuses outright
    rejected_starts: Vec<u16>,
    /// Junk registers appended to every read reply
    padding: usize,
    /// Stay silent on this many requests
    silent_requests: usize,
    requests: Vec<(u8, u16, u16)>,
}

impl SimulatedInstrument {
    fn store(&mut self, address: u16, values: &[u16]) {
        for (i, &value) in values.iter().enumerate() {
            self.registers.insert(address + i as u16, value);
        }
    }

    fn store_floats_cdab(&mut self, address: u16, values: &[f32]) {
        for (i, value) in values.iter().enumerate() {
            let bits = value.to_bits();
            self.store(address + 2 * i as u16, &[bits as u16, (bits >> 16) as u16]);
        }
    }

    fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        assert_eq!(frame.len(), 8, "unexpected request {:02X?}", frame);
        assert_eq!(crc16(&frame[..6]).to_le_bytes(), [frame[6], frame[7]]);

        let unit = frame[0];
        let function = frame[1];
        let address = u16::from_be_bytes([frame[2], frame[3]]);
        let field = u16::from_be_bytes([frame[4], frame[5]]);
        self.requests.push((function, address, field));

        if self.silent_requests > 0 {
            self.silent_requests -= 1;
            return Vec::new();
        }

        match function {
            0x04 => {
                let function = ModbusFunction::ReadInputRegisters;
                let end = address as u32 + field as u32;
                let blocked = self.rejected_starts.contains(&address)
                    || (address as u32..end).any(|a| {
                        self.unavailable.iter().any(|r| r.contains(&(a as u16)))
                    });
                if blocked {
                    return build_exception_response(unit, function, 2);
                }
                let fault = self.faults.iter().find(|(r, _)| {
                    (address as u32..end).any(|a| r.contains(&(a as u16)))
                });
                if let Some(&(_, code)) = fault {
                    return build_exception_response(unit, function, code);
                }
                let mut values: Vec<u16> = (address as u32..end)
                    .map(|a| self.registers.get(&(a as u16)).copied().unwrap_or(0))
                    .collect();
                values.extend(std::iter::repeat(0xDEAD).take(self.padding));
                build_read_response(unit, function, &values)
            }
            0x06 => {
                self.registers.insert(address, field);
                frame.to_vec()
            }
            other => build_exception_response(unit, ModbusFunction::from_u8(other & 0x7F).unwrap(), 1),
        }
    }

    fn ir_fixture() -> Self {
        let mut instrument = Self::default();
        instrument.store(400, &[1]);
        instrument.store_floats_cdab(401, &[792.0, 798.0, 0.0, 100.0, 795.0, 795.5, 3.0]);
        let data: Vec<u16> = (0..58).map(|i| if i == 40 { 60000 } else { 1000 }).collect();
        instrument.store(420, &data);
        instrument
    }
}

#[async_trait]
impl ModbusTransport for SimulatedInstrument {
    async fn exchange(&mut self, frame: &[u8]) -> ModbusResult<Vec<u8>> {
        Ok(self.respond(frame))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

fn client(instrument: SimulatedInstrument) -> InstrumentClient<SimulatedInstrument> {
    init_test_logger();
    InstrumentClient::new(instrument, 1).unwrap()
}

#[tokio::test]
async fn test_ir_spectrum_end_to_end() {
    let mut client = client(SimulatedInstrument::ir_fixture());

    let spectrum = match client.read_profile(ProfileKind::Ir).await.unwrap() {
        MeasurementResult::Ir(spectrum) => spectrum,
        other => panic!("unexpected result {:?}", other.kind()),
    };

    assert_eq!(spectrum.status, 1);
    assert_eq!(spectrum.byte_order, Some(ByteOrder::CDAB));
    assert_eq!((spectrum.x_min, spectrum.x_max), (792.0, 798.0));
    assert_eq!(spectrum.resonance_frequency, Some(795.0));
    assert_eq!(spectrum.frequency, Some(795.5));
    assert_eq!(spectrum.integral, Some(3.0));
    assert_eq!(spectrum.raw.len(), 58);
    assert_eq!(spectrum.max_index, Some(40));
    assert_eq!(spectrum.points.len(), 58);
    assert_eq!(spectrum.points[0].x, 792.0);
    assert!((spectrum.points[57].x - 798.0).abs() < 1e-9);
    assert!(spectrum.y_max > 0.0);
    assert!(spectrum.y_min.abs() < 1e-9);
    assert!(spectrum.read.is_complete());
    assert!(spectrum.read.crc_valid());

    assert_eq!(
        client.transport().requests,
        vec![(0x04, 400, 15), (0x04, 420, 58)]
    );
}

#[tokio::test]
async fn test_ir_missing_data_is_zero_filled() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.unavailable.push(420..478);
    let mut client = client(instrument);

    let spectrum = read_ir(&mut client).await.unwrap();

    assert_eq!(spectrum.read.missing, vec![MissingRange { offset: 20, quantity: 58 }]);
    assert!(spectrum.raw.iter().all(|&v| v == 0));
    assert_eq!(spectrum.frequency, Some(795.5));
    // metadata once, then the optional data chunk with its retry
    assert_eq!(client.transport().requests.len(), 3);
}

#[tokio::test]
async fn test_ir_device_failure_on_data_is_zero_filled() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.faults.push((420..478, 4));
    let mut client = client(instrument);

    let spectrum = read_ir(&mut client).await.unwrap();

    assert_eq!(spectrum.read.missing, vec![MissingRange { offset: 20, quantity: 58 }]);
    assert!(spectrum.raw.iter().all(|&v| v == 0));
    assert_eq!(spectrum.status, 1);
}

#[tokio::test]
async fn test_device_failure_on_metadata_is_fatal() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.faults.push((400..415, 4));
    let mut client = client(instrument);

    let err = read_ir(&mut client).await.unwrap_err();
    assert_eq!(err.exception_code(), Some(4));
    assert_eq!(client.transport().requests.len(), 1);
}

#[tokio::test]
async fn test_oversized_replies_stay_in_their_slots() {
    let mut instrument = SimulatedInstrument::default();
    instrument.store(0, &[100, 101, 102, 103, 104, 105, 106, 107]);
    instrument.padding = 2;
    let mut client = client(instrument);

    let plan = ReadPlan::new(ModbusFunction::ReadInputRegisters, 0)
        .required(0, 4)
        .optional(4, 4);
    let outcome = read_ranges(&mut client, &plan).await.unwrap();
    assert_eq!(outcome.registers, (100..=107).collect::<Vec<u16>>());
    assert!(outcome.missing.is_empty());
}

#[tokio::test]
async fn test_ir_gap_stays_zero_with_oversized_replies() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.padding = 3;
    let mut client = client(instrument);

    let plan = IR_LAYOUT.plan(client.reader_config());
    let outcome = read_ranges(&mut client, &plan).await.unwrap();
    assert_eq!(outcome.slice(15, 5), &[0, 0, 0, 0, 0]);
    assert_eq!(outcome.registers.len(), 78);

    let spectrum = read_ir(&mut client).await.unwrap();
    assert_eq!(spectrum.raw.len(), 58);
    assert_eq!(spectrum.max_index, Some(40));
}

#[tokio::test]
async fn test_ir_fallback_base() {
    let mut instrument = SimulatedInstrument::default();
    instrument.rejected_starts.push(400);
    instrument.store(399, &[2]);
    instrument.store_floats_cdab(400, &[792.0, 798.0, 0.0, 1.0, 794.0, 794.0, 0.5]);
    instrument.store(419, &[500; 58]);
    let mut client = client(instrument);

    let spectrum = read_ir(&mut client).await.unwrap();

    assert_eq!(spectrum.read.base_address, 399);
    assert_eq!(spectrum.status, 2);
    assert_eq!(spectrum.frequency, Some(794.0));
    assert_eq!(spectrum.raw, vec![500; 58]);
    assert_eq!(client.transport().requests[0], (0x04, 400, 15));
    assert_eq!(client.transport().requests[1], (0x04, 399, 15));
}

#[tokio::test]
async fn test_ir_raw_reads_signed_samples() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.store(420, &[0xFFFF, 0x8000]);
    let mut client = client(instrument);

    let raw = read_ir_raw(&mut client).await.unwrap();
    assert_eq!(raw.start_address, 420);
    assert_eq!(raw.values.len(), 58);
    assert_eq!(&raw.values[..3], &[-1, i16::MIN, 1000]);
    assert_eq!(raw.min_value, Some(i16::MIN));
    assert_eq!(raw.max_value, Some(1000));
}

#[tokio::test]
async fn test_ir_raw_requires_data() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.unavailable.push(430..431);
    let mut client = client(instrument);

    let err = read_ir_raw(&mut client).await.unwrap_err();
    assert_eq!(err.exception_code(), Some(2));
}

#[tokio::test]
async fn test_nmr_chunks_and_partial_data() {
    let mut instrument = SimulatedInstrument::default();
    instrument.store(100, &[256]);
    instrument.store_floats_cdab(
        101,
        &[38000.0, 44000.0, 0.0, 4095.0, 41000.0, 2.5, 7.0, 0.125],
    );
    let data: Vec<u16> = (0..256).collect();
    instrument.store(120, &data);
    instrument.unavailable.push(180..210);
    let mut client = client(instrument);

    let nmr = read_nmr(&mut client).await.unwrap();

    assert_eq!(nmr.samples, 256);
    assert_eq!(nmr.x_min, Some(38000.0));
    assert_eq!(nmr.x_max, Some(44000.0));
    assert_eq!(nmr.frequency, Some(41000.0));
    assert_eq!(nmr.amplitude, Some(2.5));
    assert_eq!(nmr.t2, Some(0.125));
    assert_eq!(nmr.data.len(), 256);
    assert_eq!(nmr.data[59], 59);
    assert!(nmr.data[60..90].iter().all(|&v| v == 0));
    assert_eq!(nmr.data[90], 90);
    assert_eq!(nmr.read.missing, vec![MissingRange { offset: 80, quantity: 30 }]);

    let quantities: Vec<u16> = client
        .transport()
        .requests
        .iter()
        .filter(|(_, address, _)| *address >= 120)
        .map(|(_, _, quantity)| *quantity)
        .collect();
    assert!(quantities.iter().all(|&q| q <= 30));
    assert_eq!(quantities.last(), Some(&16));
}

#[tokio::test]
async fn test_pxe_two_phase_read() {
    let mut instrument = SimulatedInstrument::default();
    instrument.store(500, &[3, 1]);
    instrument.store(520, &[10, 100, 20, 200, 30, 300]);
    let mut client = client(instrument);

    let series = read_pxe(&mut client).await.unwrap();

    assert_eq!(series.sample_count, 3);
    assert_eq!(series.fit, 1);
    assert_eq!(series.x, vec![10, 20, 30]);
    assert_eq!(series.y, vec![100, 200, 300]);
    assert_eq!(
        client.transport().requests,
        vec![(0x04, 500, 2), (0x04, 520, 6)]
    );
}

#[tokio::test]
async fn test_pxe_without_samples() {
    let mut instrument = SimulatedInstrument::default();
    instrument.store(500, &[0, 0]);
    let mut client = client(instrument);

    let series = read_pxe(&mut client).await.unwrap();
    assert!(series.is_empty());
    assert!(series.points.is_empty());
    assert_eq!(client.transport().requests.len(), 1);
}

#[tokio::test]
async fn test_pxe_header_unavailable() {
    let mut instrument = SimulatedInstrument::default();
    instrument.unavailable.push(500..502);
    let mut client = client(instrument);

    let err = read_pxe(&mut client).await.unwrap_err();
    assert!(err.is_unavailable_range());
}

#[tokio::test]
async fn test_first_request_dropped() {
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.silent_requests = 1;
    let mut client = client(instrument);

    let spectrum = read_ir(&mut client).await.unwrap();
    assert_eq!(spectrum.status, 1);
    assert!(spectrum.read.is_complete());
    assert_eq!(client.transport().requests.len(), 3);
}

#[tokio::test]
async fn test_relay_read_modify_write() {
    let mut instrument = SimulatedInstrument::default();
    instrument.store(1021, &[0x3402]);
    instrument.silent_requests = 1;
    let mut client = client(instrument);

    let written = client.set_relay(1021, 1).await.unwrap();
    assert_eq!(written, 0x3403);
    assert_eq!(client.transport().registers.get(&1021), Some(&0x3403));

    let requests = &client.transport().requests;
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[2], (0x06, 1021, 0x3403));
    assert_eq!(requests[3], (0x06, 1021, 0x3403));
}

#[tokio::test]
async fn test_scalar_reads() {
    let mut instrument = SimulatedInstrument::default();
    instrument.store(10, &[0xFF9C]);
    instrument.store_floats_cdab(12, &[-12.5]);
    let mut client = client(instrument);

    assert_eq!(client.read_u16(10).await.unwrap(), 0xFF9C);
    assert_eq!(client.read_i16(10).await.unwrap(), -100);
    assert_eq!(client.read_float(12).await.unwrap(), -12.5);
}

#[tokio::test]
async fn test_callback_logger_sees_traffic() {
    use std::sync::{Arc, Mutex};

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let callback: LogCallback = Box::new(move |_, message: &str| sink.lock().unwrap().push(message.to_string()));
    let logger = CallbackLogger::new(Some(callback), LogLevel::Info);

    let mut instrument = SimulatedInstrument::default();
    instrument.store(500, &[0, 0]);
    let mut client = InstrumentClient::with_logger(instrument, 1, logger).unwrap();
    read_pxe(&mut client).await.unwrap();

    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("Address: 500"));
    assert!(lines[1].starts_with("Response <-"));
}

/// Serve the simulated instrument on a local TCP port
async fn spawn_tcp_instrument(mut instrument: SimulatedInstrument, garbage: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut frame = [0u8; 8];
            while socket.read_exact(&mut frame).await.is_ok() {
                let reply = instrument.respond(&frame);
                if reply.is_empty() {
                    continue;
                }
                let mut bytes = garbage.clone();
                bytes.extend_from_slice(&reply);
                // deliver in two pieces
                let (head, tail) = bytes.split_at(bytes.len() / 2);
                if socket.write_all(head).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                if socket.write_all(tail).await.is_err() {
                    break;
                }
            }
        }
    });

    port
}

#[tokio::test]
async fn test_full_stack_over_tcp() {
    init_test_logger();
    let mut instrument = SimulatedInstrument::ir_fixture();
    instrument.silent_requests = 1;
    let port = spawn_tcp_instrument(instrument, vec![0x00, 0xFF]).await;

    let mut config = InstrumentConfig::new("127.0.0.1", port);
    config.transport.inter_byte_timeout_ms = 200;
    config.transport.packet_logging = true;
    let mut client = InstrumentClient::connect(&config).await.unwrap();
    assert!(client.is_connected());

    let spectrum = read_ir(&mut client).await.unwrap();
    assert_eq!(spectrum.byte_order, Some(ByteOrder::CDAB));
    assert_eq!(spectrum.max_index, Some(40));
    assert!(spectrum.read.is_complete());

    let stats = client.get_stats();
    assert_eq!(stats.requests_sent, 3);
    assert_eq!(stats.responses_received, 2);
    assert_eq!(stats.timeouts, 1);

    client.close().await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = InstrumentConfig::new("127.0.0.1", port);
    config.transport.connect_timeout_ms = 500;
    let err = InstrumentClient::connect(&config).await.err().unwrap();
    assert!(err.is_connection_level());
}
