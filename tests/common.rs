#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use nor_kv::{Config, Kv};
use std::sync::mpsc::{Receiver, Sender};

pub const BLOCK_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 4;
pub const BLOCK_HEADER_SIZE: usize = 4;
pub const ITEM_HEADER_SIZE: usize = 8;
pub const STATE_OFFSET: usize = 1;

pub const ITEM_NORMAL: u8 = 0xEE;
pub const ITEM_DELETED: u8 = 0x00;

/// Stops the first erase until the test lets it continue.
pub struct ErasePause {
    pub reached: Sender<()>,
    pub resume: Receiver<()>,
}

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    /// Fails the operation with this index once, the following ones succeed.
    pub fail_once: Option<usize>,
    pub operations: Vec<Operation>,
    pub erase_pause: Option<ErasePause>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(blocks: usize) -> Self {
        Self {
            buf: vec![0xffu8; BLOCK_SIZE * blocks],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(blocks: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; BLOCK_SIZE * blocks],
            fail_after_operation,
            ..Default::default()
        }
    }

    /// A fresh flash holding a copy of `image`, operation log empty.
    pub fn from_image(image: &[u8]) -> Self {
        Self {
            buf: image.to_vec(),
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_once = None;
    }

    fn fault(&mut self) -> bool {
        if self.fail_once == Some(self.operations.len()) {
            self.fail_once = None;
            return true;
        }
        self.operations.len() >= self.fail_after_operation
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    /// Flips a single bit, simulating a corrupted cell.
    pub fn flip_bit(&mut self, offset: usize, bit: u8) {
        self.buf[offset] ^= 1 << bit;
    }

    pub fn block_state(&self, block: usize) -> u8 {
        self.buf[block * BLOCK_SIZE + STATE_OFFSET]
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        println!(
            "    flash: read:  0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.fault() {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = BLOCK_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if let Some(pause) = self.erase_pause.take() {
            pause.reached.send(()).unwrap();
            pause.resume.recv().unwrap();
        }

        if self.fault() {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.fault() {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

pub fn open(flash: &mut Flash) -> Kv<&mut Flash> {
    open_with(flash, Config::default())
}

pub fn open_with(flash: &mut Flash, config: Config) -> Kv<&mut Flash> {
    let len = flash.len();
    Kv::new(0, len, flash, config).unwrap()
}

pub fn without_mapping() -> Config {
    Config {
        mapping_table: false,
        ..Config::default()
    }
}

/// Index of `operation` in the log of a fault-free run of `run` on a copy of `image`.
pub fn operation_index(
    image: &[u8],
    config: Config,
    operation: Operation,
    run: impl FnOnce(&mut Kv<&mut Flash>),
) -> usize {
    let mut dry_run = Flash::from_image(image);
    run(&mut open_with(&mut dry_run, config));
    dry_run
        .operations
        .iter()
        .position(|op| *op == operation)
        .unwrap()
}

/// Number of flash operations a clean reopen of `image` performs.
pub fn reopen_operations(image: &[u8], config: Config) -> usize {
    let mut probe = Flash::from_image(image);
    open_with(&mut probe, config);
    probe.operations.len()
}
