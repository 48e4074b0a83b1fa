//! Paged emulated memory.
//!
//! The address space is the full 64 bits. Backing pages are 4 KiB, lazily
//! allocated and zero-filled on first touch, held in an ordered map keyed
//! by page base address. Addresses at or above [`BEGIN_IO_ADDR`] are not
//! backed by pages: byte accesses there are intercepted as memory-mapped
//! I/O and wide accesses fail.
//!
//! Wide (2/4/8-byte) accesses are little-endian and may cross page
//! boundaries; the page lookup is redone whenever the running address
//! enters a new page.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::isa::{Interrupt, BEGIN_IO_ADDR, IO_STDIN_ADDR, IO_STDOUT_ADDR};

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = 0xfff;

type Page = Box<[u8; PAGE_SIZE as usize]>;

/// The emulated memory, owning its pages and the I/O handles behind the
/// MMIO window. Handles are injectable so the emulator core stays a pure
/// function over `(core, mem)` and tests can capture program output.
pub struct Mem {
    pages: BTreeMap<u64, Page>,
    stdin: Box<dyn Read>,
    stdout: Box<dyn Write>,
}

impl Default for Mem {
    fn default() -> Self {
        Mem::new()
    }
}

impl std::fmt::Debug for Mem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mem")
            .field("pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}

impl Mem {
    /// Memory wired to the process's standard streams.
    pub fn new() -> Self {
        Mem::with_io(Box::new(std::io::stdin()), Box::new(std::io::stdout()))
    }

    /// Memory with explicit I/O endpoints.
    pub fn with_io(stdin: Box<dyn Read>, stdout: Box<dyn Write>) -> Self {
        Mem {
            pages: BTreeMap::new(),
            stdin,
            stdout,
        }
    }

    /// Number of allocated pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&mut self, addr: u64) -> &mut Page {
        self.pages
            .entry(addr & !PAGE_MASK)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]))
    }

    // Reads a byte without allocating; unallocated memory reads as zero.
    fn peek(&self, addr: u64) -> u8 {
        match self.pages.get(&(addr & !PAGE_MASK)) {
            Some(page) => page[(addr & PAGE_MASK) as usize],
            None => 0,
        }
    }

    pub fn read8(&mut self, addr: u64) -> Result<u8, Interrupt> {
        if addr >= BEGIN_IO_ADDR {
            if addr == IO_STDIN_ADDR {
                let mut byte = [0u8; 1];
                return match self.stdin.read(&mut byte) {
                    Ok(1) => Ok(byte[0]),
                    // No in-band EOF channel exists for a byte port
                    Ok(_) => Ok(0xff),
                    Err(_) => Err(Interrupt::BadIoAccess),
                };
            }
            return Err(Interrupt::BadIoAccess);
        }
        let page = self.page(addr);
        Ok(page[(addr & PAGE_MASK) as usize])
    }

    pub fn write8(&mut self, addr: u64, data: u8) -> Result<(), Interrupt> {
        if addr >= BEGIN_IO_ADDR {
            if addr == IO_STDOUT_ADDR {
                return self
                    .stdout
                    .write_all(&[data])
                    .and_then(|_| self.stdout.flush())
                    .map_err(|_| Interrupt::BadIoAccess);
            }
            return Err(Interrupt::BadIoAccess);
        }
        let page = self.page(addr);
        page[(addr & PAGE_MASK) as usize] = data;
        Ok(())
    }

    // Guards a wide access of `width` bytes ending below the IO window.
    fn check_wide(addr: u64, width: u64) -> Result<(), Interrupt> {
        if addr > BEGIN_IO_ADDR - width {
            if addr < BEGIN_IO_ADDR {
                return Err(Interrupt::BadAlign); // Straddles the boundary
            }
            return Err(Interrupt::BadIoAccess); // No wide IO operations
        }
        Ok(())
    }

    /// Little-endian read of `width` ∈ {1, 2, 4, 8} bytes.
    pub fn read_w(&mut self, addr: u64, width: u64) -> Result<u64, Interrupt> {
        if width == 1 {
            return self.read8(addr).map(u64::from);
        }
        Self::check_wide(addr, width)?;
        let mut val = 0u64;
        let mut i = 0;
        while i < width {
            // Take the run of bytes that stays within one page
            let a = addr + i;
            let off = a & PAGE_MASK;
            let run = (PAGE_SIZE - off).min(width - i);
            let page = self.page(a);
            for j in 0..run {
                val |= u64::from(page[(off + j) as usize]) << (8 * (i + j));
            }
            i += run;
        }
        Ok(val)
    }

    /// Little-endian write of the low `width` bytes of `data`.
    pub fn write_w(
        &mut self,
        addr: u64,
        width: u64,
        data: u64,
    ) -> Result<(), Interrupt> {
        if width == 1 {
            return self.write8(addr, data as u8);
        }
        Self::check_wide(addr, width)?;
        let mut i = 0;
        while i < width {
            let a = addr + i;
            let off = a & PAGE_MASK;
            let run = (PAGE_SIZE - off).min(width - i);
            let page = self.page(a);
            for j in 0..run {
                page[(off + j) as usize] = (data >> (8 * (i + j))) as u8;
            }
            i += run;
        }
        Ok(())
    }

    pub fn read16(&mut self, addr: u64) -> Result<u16, Interrupt> {
        self.read_w(addr, 2).map(|v| v as u16)
    }

    pub fn read32(&mut self, addr: u64) -> Result<u32, Interrupt> {
        self.read_w(addr, 4).map(|v| v as u32)
    }

    pub fn read64(&mut self, addr: u64) -> Result<u64, Interrupt> {
        self.read_w(addr, 8)
    }

    pub fn write16(&mut self, addr: u64, data: u16) -> Result<(), Interrupt> {
        self.write_w(addr, 2, u64::from(data))
    }

    pub fn write32(&mut self, addr: u64, data: u32) -> Result<(), Interrupt> {
        self.write_w(addr, 4, u64::from(data))
    }

    pub fn write64(&mut self, addr: u64, data: u64) -> Result<(), Interrupt> {
        self.write_w(addr, 8, data)
    }

    /// Copies a buffer into memory. The whole range must lie below the IO
    /// window.
    pub fn write_block(
        &mut self,
        addr: u64,
        data: &[u8],
    ) -> Result<(), Interrupt> {
        let len = data.len() as u64;
        if len > 0 && (addr >= BEGIN_IO_ADDR || BEGIN_IO_ADDR - addr < len) {
            return Err(Interrupt::BadAddr);
        }
        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u64;
            let page = self.page(a);
            page[(a & PAGE_MASK) as usize] = *byte;
        }
        Ok(())
    }

    /// Reads a range of memory into a buffer; unallocated pages read as
    /// zero.
    pub fn read_block(
        &self,
        addr: u64,
        out: &mut [u8],
    ) -> Result<(), Interrupt> {
        let len = out.len() as u64;
        if len > 0 && (addr >= BEGIN_IO_ADDR || BEGIN_IO_ADDR - addr < len) {
            return Err(Interrupt::BadAddr);
        }
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.peek(addr + i as u64);
        }
        Ok(())
    }

    /// Streams `size` bytes from `input` into memory at `addr`.
    pub fn load_image<R: Read>(
        &mut self,
        addr: u64,
        size: u64,
        input: &mut R,
    ) -> anyhow::Result<()> {
        let mut remaining = size;
        let mut pos = addr;
        let mut buf = [0u8; PAGE_SIZE as usize];
        while remaining > 0 {
            let chunk = remaining.min(PAGE_SIZE) as usize;
            input.read_exact(&mut buf[..chunk])?;
            self.write_block(pos, &buf[..chunk])?;
            pos += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Writes a hex dump of the given range to `out`, sixteen bytes per
    /// row, skipping all-zero rows. A zero `addr` and `size` dump every
    /// allocated page.
    pub fn dump_hex<W: Write>(
        &self,
        addr: u64,
        size: u64,
        out: &mut W,
    ) -> std::io::Result<()> {
        if addr == 0 && size == 0 {
            for base in self.pages.keys() {
                self.dump_range(*base, PAGE_SIZE, out)?;
            }
            return Ok(());
        }
        self.dump_range(addr, size, out)
    }

    fn dump_range<W: Write>(
        &self,
        addr: u64,
        size: u64,
        out: &mut W,
    ) -> std::io::Result<()> {
        let mut row = addr & !0xf;
        let end = addr.saturating_add(size);
        while row < end {
            let bytes: Vec<u8> = (0..16).map(|i| self.peek(row + i)).collect();
            if bytes.iter().any(|b| *b != 0) {
                write!(out, "{row:016x}:")?;
                for b in &bytes {
                    write!(out, " {b:02x}")?;
                }
                writeln!(out)?;
            }
            match row.checked_add(16) {
                Some(next) => row = next,
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::SharedBuf;
    use std::io::Cursor;

    fn scratch_mem() -> Mem {
        Mem::with_io(Box::new(std::io::empty()), Box::new(std::io::sink()))
    }

    #[test]
    fn read_back_written_values() {
        let mut mem = scratch_mem();
        mem.write8(0x1000, 0x2a).unwrap();
        assert_eq!(mem.read8(0x1000).unwrap(), 0x2a);

        mem.write64(0x2000, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(mem.read64(0x2000).unwrap(), 0x0123_4567_89ab_cdef);
        // Little-endian byte order
        assert_eq!(mem.read8(0x2000).unwrap(), 0xef);
        assert_eq!(mem.read8(0x2007).unwrap(), 0x01);

        mem.write16(0x3000, 0xbeef).unwrap();
        assert_eq!(mem.read16(0x3000).unwrap(), 0xbeef);
        mem.write32(0x4000, 0xdead_beef).unwrap();
        assert_eq!(mem.read32(0x4000).unwrap(), 0xdead_beef);
    }

    #[test]
    fn unallocated_memory_reads_zero() {
        let mut mem = scratch_mem();
        assert_eq!(mem.read64(0xdead_0000).unwrap(), 0);
    }

    #[test]
    fn wide_access_crosses_page_boundary() {
        let mut mem = scratch_mem();
        mem.write64(0x1ffc, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read64(0x1ffc).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(mem.read8(0x1fff).unwrap(), 0x55);
        assert_eq!(mem.read8(0x2000).unwrap(), 0x44);
        assert_eq!(mem.page_count(), 2);
    }

    #[test]
    fn stdout_byte_write() {
        let buf = SharedBuf::default();
        let mut mem =
            Mem::with_io(Box::new(std::io::empty()), Box::new(buf.clone()));
        mem.write8(IO_STDOUT_ADDR, b'\n').unwrap();
        assert_eq!(*buf.0.borrow(), b"\n");
    }

    #[test]
    fn stdin_byte_read() {
        let mut mem = Mem::with_io(
            Box::new(Cursor::new(b"hi".to_vec())),
            Box::new(std::io::sink()),
        );
        assert_eq!(mem.read8(IO_STDIN_ADDR).unwrap(), b'h');
        assert_eq!(mem.read8(IO_STDIN_ADDR).unwrap(), b'i');
        // EOF reads as 0xff
        assert_eq!(mem.read8(IO_STDIN_ADDR).unwrap(), 0xff);
    }

    #[test]
    fn io_window_faults() {
        let mut mem = scratch_mem();
        // Reserved IO addresses
        assert_eq!(
            mem.read8(BEGIN_IO_ADDR + 3).unwrap_err(),
            Interrupt::BadIoAccess
        );
        assert_eq!(
            mem.write8(BEGIN_IO_ADDR + 4, 1).unwrap_err(),
            Interrupt::BadIoAccess
        );
        // Byte read from the stdout port is not defined either
        assert_eq!(
            mem.read8(IO_STDOUT_ADDR).unwrap_err(),
            Interrupt::BadIoAccess
        );
        // Wide accesses inside the window
        assert_eq!(
            mem.read64(BEGIN_IO_ADDR).unwrap_err(),
            Interrupt::BadIoAccess
        );
    }

    #[test]
    fn straddling_the_io_boundary_is_bad_align() {
        let mut mem = scratch_mem();
        assert_eq!(
            mem.write16(BEGIN_IO_ADDR - 1, 0).unwrap_err(),
            Interrupt::BadAlign
        );
        assert_eq!(
            mem.read32(BEGIN_IO_ADDR - 2).unwrap_err(),
            Interrupt::BadAlign
        );
        assert_eq!(
            mem.read64(BEGIN_IO_ADDR - 7).unwrap_err(),
            Interrupt::BadAlign
        );
        // Flush against the boundary is fine
        mem.write64(BEGIN_IO_ADDR - 8, 42).unwrap();
    }

    #[test]
    fn block_transfer() {
        let mut mem = scratch_mem();
        mem.write_block(0xfff, b"abcd").unwrap();
        let mut back = [0u8; 4];
        mem.read_block(0xfff, &mut back).unwrap();
        assert_eq!(&back, b"abcd");
        assert_eq!(
            mem.write_block(BEGIN_IO_ADDR - 1, b"xy").unwrap_err(),
            Interrupt::BadAddr
        );
    }

    #[test]
    fn load_image_streams_bytes() {
        let mut mem = scratch_mem();
        let mut input = Cursor::new(vec![7u8; 0x1800]);
        mem.load_image(0x1000, 0x1800, &mut input).unwrap();
        assert_eq!(mem.read8(0x1000).unwrap(), 7);
        assert_eq!(mem.read8(0x27ff).unwrap(), 7);
        assert_eq!(mem.read8(0x2800).unwrap(), 0);
    }

    #[test]
    fn hex_dump_skips_zero_rows() {
        let mut mem = scratch_mem();
        mem.write8(0x1020, 0xab).unwrap();
        let mut out = Vec::new();
        mem.dump_hex(0, 0, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("0000000000001020: ab 00"));
    }
}
