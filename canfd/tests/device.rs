//! Driver-level tests against a scripted register model.
//!
//! The mock implements the `Registers` word ports faithfully: `RX_PORT`
//! reads pop queued frame words, `TX_PORT` writes accumulate until a
//! transmit request flushes them, and `INT_STAT` is write-to-clear. Tests
//! inject interrupt causes and call the dispatcher directly, standing in for
//! the platform's vector.

use canfd::bus::{events, Can, Error, TX_BUFFER_ERROR_REPORT_CAP};
use canfd::core::{Dependencies, EventGroup, OutOfMemory, Registers};
use canfd::filter::AcceptanceFilter;
use canfd::message::Message;
use canfd::reg;
use canfd::config::WorkMode;
use embedded_can::{Id, StandardId};
use fugit::RateExtU32;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

const CLOCK_HZ: u32 = 80_000_000;

const IRQ_RX: u32 = 1 << 0;
const IRQ_TX_DONE: u32 = 1 << 1;
const IRQ_ERROR_WARNING: u32 = 1 << 2;
const IRQ_BUS_ERROR: u32 = 1 << 5;

#[derive(Default)]
struct RegState {
    regs: [u32; 32],
    writes: Vec<(usize, u32)>,
    rx_queue: VecDeque<Vec<u32>>,
    rx_cursor: usize,
    tx_words: Vec<u32>,
    sent: Vec<Vec<u32>>,
    tx_idle: bool,
    status_bits: u32,
}

impl RegState {
    fn status(&self) -> u32 {
        let mut bits = self.status_bits;
        if !self.rx_queue.is_empty() {
            bits |= reg::status::RX_NONEMPTY;
        }
        if self.tx_idle {
            bits |= reg::status::TX_IDLE;
        }
        bits
    }

    fn rx_stat(&self) -> u32 {
        let mut bits = self.rx_queue.len() as u32 & reg::rx_stat::FRAME_COUNT;
        if let Some(frame) = self.rx_queue.front() {
            if self.rx_cursor > 0 && self.rx_cursor < frame.len() {
                bits |= reg::rx_stat::MORE;
            }
        }
        bits
    }

    fn pop_rx_word(&mut self) -> u32 {
        let Some(frame) = self.rx_queue.front() else {
            return 0;
        };
        let word = frame[self.rx_cursor];
        self.rx_cursor += 1;
        if self.rx_cursor == frame.len() {
            self.rx_queue.pop_front();
            self.rx_cursor = 0;
        }
        word
    }
}

#[derive(Clone)]
struct MockRegs(Rc<RefCell<RegState>>);

unsafe impl Registers for MockRegs {
    fn read(&self, offset: usize) -> u32 {
        let mut state = self.0.borrow_mut();
        match offset {
            reg::STATUS => state.status(),
            reg::RX_STAT => state.rx_stat(),
            reg::RX_PORT => state.pop_rx_word(),
            _ => state.regs[offset / 4],
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.0.borrow_mut();
        state.writes.push((offset, value));
        match offset {
            reg::INT_STAT => state.regs[offset / 4] &= !value,
            reg::TX_PORT => state.tx_words.push(value),
            reg::CMD => {
                if value & reg::cmd::TX_REQ != 0 {
                    let frame = std::mem::take(&mut state.tx_words);
                    state.sent.push(frame);
                }
            }
            _ => state.regs[offset / 4] = value,
        }
    }
}

#[derive(Default)]
struct EventState {
    posted: u32,
}

#[derive(Clone)]
struct MockEvents(Rc<RefCell<EventState>>);

impl EventGroup for MockEvents {
    fn post(&self, events: u32) {
        self.0.borrow_mut().posted |= events;
    }

    fn wait(&self, events: u32, _timeout_ms: u32) -> u32 {
        let mut state = self.0.borrow_mut();
        let satisfied = state.posted & events;
        state.posted &= !satisfied;
        // An empty intersection stands in for timeout expiry.
        satisfied
    }
}

struct MockDeps {
    events: MockEvents,
    events_created: Rc<Cell<u32>>,
    interrupt_enabled: Rc<Cell<bool>>,
}

unsafe impl Dependencies for MockDeps {
    type Events = MockEvents;

    fn can_clock(&self) -> fugit::HertzU32 {
        CLOCK_HZ.Hz()
    }

    fn create_events(&mut self) -> Result<MockEvents, OutOfMemory> {
        self.events_created.set(self.events_created.get() + 1);
        Ok(self.events.clone())
    }

    fn install_interrupt_handler(&mut self) {}

    fn enable_interrupt(&mut self) {
        self.interrupt_enabled.set(true);
    }

    fn disable_interrupt(&mut self) {
        self.interrupt_enabled.set(false);
    }
}

struct Harness {
    can: Can<MockRegs, MockDeps>,
    regs: Rc<RefCell<RegState>>,
    events: Rc<RefCell<EventState>>,
    events_created: Rc<Cell<u32>>,
    interrupt_enabled: Rc<Cell<bool>>,
}

fn harness() -> Harness {
    let regs = Rc::new(RefCell::new(RegState {
        tx_idle: true,
        ..RegState::default()
    }));
    let events = Rc::new(RefCell::new(EventState::default()));
    let events_created = Rc::new(Cell::new(0));
    let interrupt_enabled = Rc::new(Cell::new(false));
    let deps = MockDeps {
        events: MockEvents(events.clone()),
        events_created: events_created.clone(),
        interrupt_enabled: interrupt_enabled.clone(),
    };
    Harness {
        can: Can::new(MockRegs(regs.clone()), deps),
        regs,
        events,
        events_created,
        interrupt_enabled,
    }
}

fn standard(raw: u16) -> Id {
    Id::Standard(StandardId::new(raw).unwrap())
}

/// Wire words for a standard-identifier classic data frame.
fn classic_words(id: u16, data: &[u8]) -> Vec<u32> {
    let mut words = vec![u32::from(id) << 18, (data.len() as u32) << 16];
    for chunk in data.chunks(4) {
        let mut bytes = [0u8; 4];
        bytes[..chunk.len()].copy_from_slice(chunk);
        words.push(u32::from_le_bytes(bytes));
    }
    words
}

fn inject_rx(regs: &Rc<RefCell<RegState>>, words: Vec<u32>) {
    let mut state = regs.borrow_mut();
    state.rx_queue.push_back(words);
    state.regs[reg::INT_STAT / 4] |= IRQ_RX;
}

fn mode_written(regs: &Rc<RefCell<RegState>>) -> u32 {
    let state = regs.borrow();
    state
        .writes
        .iter()
        .rev()
        .find(|(offset, _)| *offset == reg::MODE)
        .map(|(_, value)| *value)
        .expect("no MODE write recorded")
}

fn wrote_offset(regs: &Rc<RefCell<RegState>>, offset: usize) -> bool {
    regs.borrow().writes.iter().any(|(o, _)| *o == offset)
}

#[test]
fn initialize_is_idempotent() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.initialize().unwrap();
    assert_eq!(h.events_created.get(), 1);
    assert!(h.can.is_initialized());
    assert!(!h.can.is_opened());
}

#[test]
fn initialize_puts_the_hardware_into_reset() {
    let mut h = harness();
    {
        let mut state = h.regs.borrow_mut();
        state.regs[reg::CTRL / 4] = reg::ctrl::EN;
        state.regs[reg::INT_MASK / 4] = 0xFF;
        state.regs[reg::INT_STAT / 4] = 0xAA;
    }
    h.can.initialize().unwrap();
    let state = h.regs.borrow();
    assert_eq!(state.regs[reg::CTRL / 4] & reg::ctrl::EN, 0);
    assert_eq!(state.regs[reg::INT_MASK / 4], 0);
    assert_eq!(state.regs[reg::INT_STAT / 4], 0);
}

#[test]
fn open_requires_initialize() {
    let mut h = harness();
    assert_eq!(h.can.open(), Err(Error::NotInitialized));
    // Closing a device that is not open is a no-op.
    assert_eq!(h.can.close(), Ok(()));
}

#[test]
fn open_enables_hardware_and_close_reverses_it() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    assert!(h.can.is_opened());
    assert!(h.interrupt_enabled.get());
    {
        let state = h.regs.borrow();
        assert_eq!(state.regs[reg::CTRL / 4] & reg::ctrl::EN, reg::ctrl::EN);
        assert_eq!(state.regs[reg::INT_MASK / 4], 0xFF);
        assert_eq!(
            state.regs[reg::BTIME / 4],
            h.can.bit_timing().unwrap().register_image()
        );
    }
    // Opening again is a no-op that leaves the session running.
    assert_eq!(h.can.open(), Ok(()));
    assert!(h.can.is_opened());

    h.can.close().unwrap();
    assert!(!h.can.is_opened());
    assert!(!h.interrupt_enabled.get());
    let state = h.regs.borrow();
    assert_eq!(state.regs[reg::CTRL / 4] & reg::ctrl::EN, 0);
    assert_eq!(state.regs[reg::INT_MASK / 4], 0);
}

#[test]
fn statistics_survive_close_and_reset_at_reopen() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    let frame = Message::new(standard(0x10), &[0xAB]).unwrap();
    h.can.write(&[frame]).unwrap();
    assert_eq!(h.can.statistics().tx_frames, 1);

    h.can.close().unwrap();
    assert_eq!(h.can.statistics().tx_frames, 1);

    h.can.open().unwrap();
    assert_eq!(h.can.statistics().tx_frames, 0);
}

#[test]
fn direct_send_uses_the_idle_hardware_buffer() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    let frame = Message::new(standard(0x123), &[1, 2, 3, 4]).unwrap();
    assert_eq!(h.can.write(&[frame]), Ok(1));
    let state = h.regs.borrow();
    assert_eq!(state.sent, vec![classic_words(0x123, &[1, 2, 3, 4])]);
}

#[test]
fn received_frames_round_trip_through_the_ports() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    inject_rx(&h.regs, classic_words(0x123, &[1, 2, 3, 4]));
    inject_rx(&h.regs, classic_words(0x456, &[5, 6]));
    h.can.interrupt();
    assert_eq!(h.can.statistics().rx_frames, 2);
    assert_eq!(h.events.borrow().posted & events::RX_AVAILABLE, events::RX_AVAILABLE);

    let mut inbox = [Message::default(); 4];
    assert_eq!(h.can.read(&mut inbox), Ok(2));
    assert_eq!(inbox[0].id, standard(0x123));
    assert_eq!(inbox[0].payload(), &[1, 2, 3, 4]);
    assert_eq!(inbox[1].id, standard(0x456));
    assert_eq!(inbox[1].payload(), &[5, 6]);
}

#[test]
fn read_returns_zero_on_timeout() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    let mut inbox = [Message::default(); 1];
    assert_eq!(h.can.read(&mut inbox), Ok(0));
}

#[test]
fn write_accepts_a_partial_batch_when_the_ring_fills() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.set_ring_capacity(2).unwrap();
    h.can.open().unwrap();
    // A busy transmitter forces everything through the ring.
    h.regs.borrow_mut().tx_idle = false;

    let frames: Vec<Message> = (0..5)
        .map(|i| Message::new(standard(i), &[i as u8]).unwrap())
        .collect();
    assert_eq!(h.can.write(&frames), Ok(2));
    assert!(h.can.statistics().tx_ring_full > 0);
    // Timeout expiry with nothing accepted is still a count, not an error.
    assert_eq!(h.can.write(&frames), Ok(0));
}

#[test]
fn queued_frames_flush_on_transmit_done() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    h.regs.borrow_mut().tx_idle = false;
    let frame = Message::new(standard(0x77), &[9]).unwrap();
    assert_eq!(h.can.write(&[frame]), Ok(1));
    assert!(h.regs.borrow().sent.is_empty());

    {
        let mut state = h.regs.borrow_mut();
        state.tx_idle = true;
        state.regs[reg::INT_STAT / 4] |= IRQ_TX_DONE;
    }
    h.can.interrupt();
    assert_eq!(h.regs.borrow().sent, vec![classic_words(0x77, &[9])]);
    assert_eq!(h.events.borrow().posted & events::TX_SPACE, events::TX_SPACE);
}

#[test]
fn nonblocking_calls_report_would_block() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.set_ring_capacity(1).unwrap();
    h.can.open().unwrap();
    assert_eq!(h.can.try_read(), Err(nb::Error::WouldBlock));

    h.regs.borrow_mut().tx_idle = false;
    let frame = Message::new(standard(0x42), &[7]).unwrap();
    assert_eq!(h.can.try_write(&frame), Ok(()));
    assert_eq!(h.can.try_write(&frame), Err(nb::Error::WouldBlock));

    inject_rx(&h.regs, classic_words(0x42, &[7]));
    h.can.interrupt();
    assert_eq!(h.can.try_read(), Ok(frame));
}

#[test]
fn bus_off_tears_the_session_down_synchronously() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    {
        let mut state = h.regs.borrow_mut();
        state.status_bits |= reg::status::BUS_OFF;
        state.regs[reg::INT_STAT / 4] |= IRQ_BUS_ERROR;
        // Ack error at bit position 14.
        state.regs[reg::ERR_CAP / 4] = 4 | 14 << 3;
    }
    h.can.interrupt();

    assert!(!h.can.is_opened());
    assert!(!h.interrupt_enabled.get());
    let stats = h.can.statistics();
    assert_eq!(stats.bus_off, 1);
    assert_eq!(stats.bus_errors, 1);
    assert_eq!(stats.bus_error_kinds[4], 1);
    assert_eq!(h.events.borrow().posted & events::FAULT, events::FAULT);

    // Task-level calls fail promptly instead of blocking.
    let mut inbox = [Message::default(); 1];
    assert_eq!(h.can.read(&mut inbox), Err(Error::NotOpened));
    assert_eq!(h.can.write(&[Message::default()]), Err(Error::NotOpened));
}

#[test]
fn reopening_after_bus_off_starts_clean() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    {
        let mut state = h.regs.borrow_mut();
        state.status_bits |= reg::status::BUS_OFF;
        state.regs[reg::INT_STAT / 4] |= IRQ_BUS_ERROR;
    }
    h.can.interrupt();
    assert!(!h.can.is_opened());
    assert_eq!(h.events.borrow().posted & events::FAULT, events::FAULT);

    // The bus recovered; the fault wake from the old session must not
    // satisfy waits in the new one.
    h.regs.borrow_mut().status_bits &= !reg::status::BUS_OFF;
    h.can.open().unwrap();
    assert_eq!(h.events.borrow().posted, 0);
    let mut inbox = [Message::default(); 1];
    assert_eq!(h.can.read(&mut inbox), Ok(0));
    let frame = Message::new(standard(0x21), &[1]).unwrap();
    assert_eq!(h.can.write(&[frame]), Ok(1));
}

#[test]
fn tx_encode_failures_are_flagged_and_capped() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can
        .set_workmode(WorkMode {
            fd: true,
            ..WorkMode::default()
        })
        .unwrap();
    h.can.open().unwrap();
    h.regs.borrow_mut().tx_idle = false;
    let frames: Vec<Message> = (0..20)
        .map(|i| Message::new(standard(i), &[0; 12]).unwrap())
        .collect();
    assert_eq!(h.can.write(&frames), Ok(20));
    assert!(!h.can.status().buffer_error);

    // The hardware left FD mode underneath the queue; the queued FD-sized
    // frames no longer encode for the transmit buffer.
    {
        let mut state = h.regs.borrow_mut();
        state.regs[reg::MODE / 4] &= !reg::mode::FDEN;
        state.tx_idle = true;
        state.regs[reg::INT_STAT / 4] |= IRQ_TX_DONE;
    }
    h.can.interrupt();
    assert!(h.regs.borrow().sent.is_empty());
    assert!(h.can.status().buffer_error);
    assert_eq!(
        h.can.statistics().tx_buffer_errors,
        TX_BUFFER_ERROR_REPORT_CAP
    );
    // The flag clears at the next start.
    h.can.close().unwrap();
    h.can.open().unwrap();
    assert!(!h.can.status().buffer_error);
}

#[test]
fn unchanged_static_configuration_is_not_rewritten() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    h.can.close().unwrap();
    h.regs.borrow_mut().writes.clear();
    h.can.open().unwrap();
    assert!(!wrote_offset(&h.regs, reg::MODE));
    assert!(!wrote_offset(&h.regs, reg::BTIME));
    assert!(!wrote_offset(&h.regs, reg::TSPRESC));
    assert!(!wrote_offset(&h.regs, reg::RETRY));

    h.can.close().unwrap();
    h.can.set_bitrate(250_000.Hz()).unwrap();
    h.regs.borrow_mut().writes.clear();
    h.can.open().unwrap();
    assert!(wrote_offset(&h.regs, reg::BTIME));
    assert!(!wrote_offset(&h.regs, reg::MODE));
}

#[test]
fn error_warning_resets_the_hardware_counters() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    h.regs.borrow_mut().regs[reg::INT_STAT / 4] |= IRQ_ERROR_WARNING;
    h.can.interrupt();
    assert_eq!(h.can.statistics().error_warnings, 1);
    assert!(h.can.is_opened());
    let state = h.regs.borrow();
    assert!(state
        .writes
        .iter()
        .any(|&(offset, value)| offset == reg::CMD && value == reg::cmd::ERRC_RESET));
}

#[test]
fn full_rx_ring_drops_the_oldest_frame() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.set_ring_capacity(2).unwrap();
    h.can.open().unwrap();
    for id in 1..=3u16 {
        inject_rx(&h.regs, classic_words(id, &[id as u8]));
    }
    h.can.interrupt();
    assert_eq!(h.can.statistics().rx_ring_drops, 1);

    let mut inbox = [Message::default(); 4];
    assert_eq!(h.can.read(&mut inbox), Ok(2));
    assert_eq!(inbox[0].id, standard(2));
    assert_eq!(inbox[1].id, standard(3));
}

#[test]
fn classic_mode_bounds_the_payload() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    let fd_frame = Message::new(standard(1), &[0; 12]).unwrap();
    assert_eq!(h.can.write(&[fd_frame]), Err(Error::InvalidArgument));

    h.can.close().unwrap();
    h.can
        .set_workmode(WorkMode {
            fd: true,
            ..WorkMode::default()
        })
        .unwrap();
    h.can.open().unwrap();
    assert_eq!(h.can.write(&[fd_frame]), Ok(1));
    assert_eq!(mode_written(&h.regs) & reg::mode::FDEN, reg::mode::FDEN);
    // DLC 9 covers 9..=12 bytes, FDF flag set.
    let sent = h.regs.borrow().sent.clone();
    assert_eq!(sent[0][1], 9 << 16 | 1 << 21);
    assert_eq!(sent[0].len(), 2 + 3);
}

#[test]
fn configuration_is_rejected_while_open() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can.open().unwrap();
    assert_eq!(h.can.set_bitrate(125_000.Hz()), Err(Error::Busy));
    assert_eq!(h.can.set_workmode(WorkMode::default()), Err(Error::Busy));
    assert_eq!(h.can.set_ring_capacity(8), Err(Error::Busy));
    assert_eq!(h.can.set_filter(3, None), Err(Error::OutOfBounds));
    // Timeouts are adjustable in any state, clamped to the supported band.
    h.can.set_rx_timeout(5_000);
    assert_eq!(h.can.config().rx_timeout_ms, 1_000);
}

#[test]
fn bitrate_changes_resolve_new_timing() {
    let mut h = harness();
    h.can.initialize().unwrap();
    let before = h.can.bit_timing().unwrap();
    h.can.set_bitrate(125_000.Hz()).unwrap();
    let after = h.can.bit_timing().unwrap();
    assert_ne!(before, after);
    assert_eq!(after.bitrate(CLOCK_HZ.Hz()).to_Hz(), 125_000);
}

#[test]
fn filters_are_written_once_until_changed() {
    let mut h = harness();
    h.can.initialize().unwrap();
    h.can
        .set_filter(
            0,
            Some(AcceptanceFilter {
                mask: 0x00F,
                value: 0x120,
                standard: true,
                extended: false,
            }),
        )
        .unwrap();
    h.can.open().unwrap();
    assert!(wrote_offset(&h.regs, reg::FILTER_MASK[0]));
    assert_eq!(mode_written(&h.regs) & reg::mode::AFM, reg::mode::AFM);
    {
        let state = h.regs.borrow();
        assert_eq!(state.regs[reg::FILTER_MASK[0] / 4], 0x00F);
        assert_eq!(state.regs[reg::FILTER_VALUE[0] / 4], 0x120);
    }

    // An unchanged filter set is not rewritten at the next start; the
    // acceptance-filter mode bit stays in force from the cached MODE value.
    h.can.close().unwrap();
    h.regs.borrow_mut().writes.clear();
    h.can.open().unwrap();
    assert!(!wrote_offset(&h.regs, reg::FILTER_MASK[0]));
    assert!(!wrote_offset(&h.regs, reg::MODE));
    assert_eq!(
        h.regs.borrow().regs[reg::MODE / 4] & reg::mode::AFM,
        reg::mode::AFM
    );

    // Reverting every filter to the default clears acceptance filtering.
    h.can.close().unwrap();
    h.can.set_filter(0, None).unwrap();
    h.regs.borrow_mut().writes.clear();
    h.can.open().unwrap();
    assert!(wrote_offset(&h.regs, reg::FILTER_MASK[0]));
    assert_eq!(mode_written(&h.regs) & reg::mode::AFM, 0);
    assert_eq!(h.regs.borrow().regs[reg::FILTER_CTRL / 4], 0);
}
