//! A simulated SUSI bus
//!
//! One [Wire] is shared by a Master side HAL and any number of Slave side
//! HALs. Both lines are open-drain: the data level is the wired-AND of the
//! Master, every Slave's reverse channel drive, and every Slave's ACK pulses.
//!
//! Time is driven by the Master. Whenever the Master samples the data line,
//! every Slave's main loop gets to run first, at the Master's current time.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use susi_comms::{
    cv::RamPersistence,
    framer::{AddressFilter, FrameReceiver},
    slave::SlaveConfig,
    EdgeHandler, Level, Master, Slave, SusiHal,
};

pub struct Wire {
    pub now: u64,
    pub clock: Level,
    pub master_data: Level,
    handlers: Vec<&'static dyn EdgeHandler>,
    drives: Vec<Level>,
    pulses: Vec<(u64, u64)>,
    pending_low: Vec<u64>,
}

impl Wire {
    fn new() -> Self {
        Self {
            now: 0,
            clock: Level::High,
            master_data: Level::High,
            handlers: Vec::new(),
            drives: Vec::new(),
            pulses: Vec::new(),
            pending_low: Vec::new(),
        }
    }

    pub fn data_at(&self, t: u64) -> Level {
        let pulsed = self.pulses.iter().any(|(from, until)| (*from..*until).contains(&t));
        let pending = self.pending_low.iter().any(|from| t >= *from);
        let driven = self.drives.iter().any(|l| l.is_low());
        Level::from(self.master_data.is_high() && !pulsed && !pending && !driven)
    }
}

pub struct MasterPins {
    wire: Rc<RefCell<Wire>>,
    service: Option<Box<dyn FnMut(u64)>>,
}

impl SusiHal for MasterPins {
    fn set_clock(&mut self, level: Level) {
        let (falling, handlers, data, now) = {
            let mut w = self.wire.borrow_mut();
            let falling = w.clock.is_high() && level.is_low();
            w.clock = level;
            (falling, w.handlers.clone(), w.data_at(w.now), w.now)
        };
        if !falling {
            return;
        }
        // Every node samples the same level, then updates its drive
        let drives: Vec<Level> = handlers
            .iter()
            .map(|h| {
                h.on_clock_falling(data, Instant::from_micros(now))
                    .unwrap_or(Level::High)
            })
            .collect();
        self.wire.borrow_mut().drives = drives;
    }

    fn set_data(&mut self, level: Level) {
        self.wire.borrow_mut().master_data = level;
    }

    fn read_clock(&mut self) -> Level {
        self.wire.borrow().clock
    }

    fn read_data(&mut self) -> Level {
        let now = self.wire.borrow().now;
        if let Some(service) = self.service.as_mut() {
            service(now);
        }
        self.wire.borrow().data_at(now)
    }

    fn attach_clock_falling(&mut self, _handler: &'static dyn EdgeHandler) {}

    fn micros(&mut self) -> u64 {
        self.wire.borrow().now
    }

    fn delay_us(&mut self, us: u32) {
        self.wire.borrow_mut().now += u64::from(us);
    }
}

pub struct SlavePins {
    wire: Rc<RefCell<Wire>>,
    clock: Rc<Cell<u64>>,
    low_since: Option<u64>,
}

impl SusiHal for SlavePins {
    fn set_clock(&mut self, _level: Level) {}

    fn set_data(&mut self, level: Level) {
        let now = self.clock.get();
        let mut w = self.wire.borrow_mut();
        match (level, self.low_since) {
            (Level::Low, None) => {
                self.low_since = Some(now);
                w.pending_low.push(now);
            }
            (Level::High, Some(from)) => {
                self.low_since = None;
                w.pending_low.retain(|t| *t != from);
                w.pulses.push((from, now));
            }
            _ => {}
        }
    }

    fn read_clock(&mut self) -> Level {
        self.wire.borrow().clock
    }

    fn read_data(&mut self) -> Level {
        self.wire.borrow().data_at(self.clock.get())
    }

    fn attach_clock_falling(&mut self, handler: &'static dyn EdgeHandler) {
        let mut w = self.wire.borrow_mut();
        w.handlers.push(handler);
        w.drives.push(Level::High);
    }

    fn micros(&mut self) -> u64 {
        self.clock.get()
    }

    fn delay_us(&mut self, us: u32) {
        self.clock.set(self.clock.get() + u64::from(us));
    }
}

pub type SimSlave = Slave<'static, SlavePins, CriticalSectionRawMutex, RamPersistence>;
pub type SimMaster = Master<'static, MasterPins>;

pub struct Bus {
    pub master: SimMaster,
    pub slaves: Vec<Rc<RefCell<SimSlave>>>,
    pub wire: Rc<RefCell<Wire>>,
}

impl Bus {
    pub fn slave(&self, idx: usize) -> std::cell::RefMut<'_, SimSlave> {
        self.slaves[idx].borrow_mut()
    }
}

pub fn config(address: u8) -> SlaveConfig {
    SlaveConfig {
        address,
        manufacturer_id: 0x0097,
        hardware_id: 0x1234,
        version: 0x0205,
    }
}

/// Build a bus with one Slave per address, each polled from the Master's
/// data line reads
pub fn bus(addresses: &[u8]) -> Bus {
    let wire = Rc::new(RefCell::new(Wire::new()));

    let mut slaves = Vec::new();
    let mut clocks = Vec::new();
    for &address in addresses {
        let rx: &'static FrameReceiver<CriticalSectionRawMutex> =
            Box::leak(Box::new(FrameReceiver::new(AddressFilter::Any)));
        let clock = Rc::new(Cell::new(0));
        let pins = SlavePins {
            wire: wire.clone(),
            clock: clock.clone(),
            low_since: None,
        };
        let mut slave = Slave::new(pins, rx, config(address), RamPersistence::new());
        slave.begin();
        slaves.push(Rc::new(RefCell::new(slave)));
        clocks.push(clock);
    }

    let polled = slaves.clone();
    let service = move |now: u64| {
        for (slave, clock) in polled.iter().zip(clocks.iter()) {
            clock.set(clock.get().max(now));
            while slave.borrow_mut().poll().is_some() {}
        }
    };

    let pins = MasterPins {
        wire: wire.clone(),
        service: Some(Box::new(service)),
    };
    let mut master = Master::new(pins);
    master.begin();

    Bus {
        master,
        slaves,
        wire,
    }
}
