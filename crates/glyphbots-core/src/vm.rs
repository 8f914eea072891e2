//! Stack virtual machine that renders raster images from byte programs.
//!
//! Execution is deterministic apart from the RANDOM opcode, bounded by an
//! instruction budget, and never fails outward: faults are recorded in the
//! per-run [`ExecutionStats`] and the partial canvas is returned as-is.

use std::fmt::Write as _;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::generator::{BytecodeGenerator, DEFAULT_COMPOSITE_CHANCE};
use crate::opcode::Opcode;

/// Number of segments used to approximate a quadratic Bézier curve.
const BEZIER_SEGMENTS: u32 = 30;

/// Static configuration of the virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmConfig {
    /// Output canvas width in pixels.
    pub image_width: u32,
    /// Output canvas height in pixels.
    pub image_height: u32,
    /// Bytes of program memory; programs longer than this are truncated.
    pub memory_size: u32,
    /// Operand stack capacity in bytes.
    pub stack_size: u32,
    /// Instruction budget per execution.
    pub max_instructions: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            image_width: 256,
            image_height: 256,
            memory_size: 1024,
            stack_size: 256,
            max_instructions: 10_000,
        }
    }
}

/// Raw RGB8 raster produced by an execution. Row-major, three bytes per
/// pixel; encoding to a file format is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Image {
    /// Creates a black canvas of the given dimensions.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize) * 3],
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Flat RGB byte buffer, `3 * width * height` long.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.width as usize) + (x as usize)) * 3
    }

    /// Reads the pixel at `(x, y)`. Coordinates must be in bounds.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = self.offset(x, y);
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Reads the pixel at `(x, y)`, or `None` when out of bounds.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        (x < self.width && y < self.height).then(|| self.pixel(x, y))
    }

    /// Writes `color` at `(x, y)`; out-of-bounds writes are silently skipped.
    pub fn set_pixel(&mut self, x: i32, y: i32, color: [u8; 3]) {
        if x < 0 || y < 0 {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = self.offset(x, y);
        self.data[idx..idx + 3].copy_from_slice(&color);
    }

    /// Per-channel standard deviation over the whole canvas.
    #[must_use]
    pub fn channel_std_dev(&self) -> [f64; 3] {
        let pixels = (self.width as usize) * (self.height as usize);
        if pixels == 0 {
            return [0.0; 3];
        }
        let mut sums = [0.0f64; 3];
        let mut squares = [0.0f64; 3];
        for chunk in self.data.chunks_exact(3) {
            for channel in 0..3 {
                let value = f64::from(chunk[channel]);
                sums[channel] += value;
                squares[channel] += value * value;
            }
        }
        let count = pixels as f64;
        let mut result = [0.0; 3];
        for channel in 0..3 {
            let mean = sums[channel] / count;
            let variance = (squares[channel] / count - mean * mean).max(0.0);
            result[channel] = variance.sqrt();
        }
        result
    }
}

/// Mutable machine state for a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmState {
    /// Operand stack, bounded by `stack_size`.
    pub stack: Vec<u8>,
    /// Program memory, sized by `memory_size`.
    pub memory: Vec<u8>,
    /// Program counter indexing into memory.
    pub pc: usize,
    /// Drawing cursor.
    pub x: i32,
    /// Drawing cursor.
    pub y: i32,
    /// Active RGB color.
    pub color: [u8; 3],
    /// Cleared only by HALT.
    pub running: bool,
}

impl VmState {
    /// Fresh state for the given configuration.
    #[must_use]
    pub fn new(config: &VmConfig) -> Self {
        Self {
            stack: Vec::new(),
            memory: vec![0; config.memory_size as usize],
            pc: 0,
            x: 0,
            y: 0,
            color: [0; 3],
            running: true,
        }
    }
}

/// Statistics for the most recent execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub instructions_executed: u32,
    pub pixels_drawn: u32,
    pub stack_operations: u32,
    pub memory_operations: u32,
    /// True only when HALT cleared the running flag; budget exhaustion, a PC
    /// overrun, and faults all leave this false.
    pub halted_normally: bool,
    pub error_message: Option<String>,
}

/// The bytecode interpreter. Owns its canvas, per-run state, and the RNG
/// backing the RANDOM opcode.
#[derive(Debug)]
pub struct BytecodeVm {
    config: VmConfig,
    state: VmState,
    canvas: Image,
    last_stats: ExecutionStats,
    rng: SmallRng,
    generator: BytecodeGenerator,
}

impl BytecodeVm {
    /// Creates a VM seeded from entropy.
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        let seed: u64 = rand::random();
        Self::with_seed(config, seed)
    }

    /// Creates a VM with a fixed seed; RANDOM and generated programs become
    /// reproducible.
    #[must_use]
    pub fn with_seed(config: VmConfig, seed: u64) -> Self {
        let state = VmState::new(&config);
        let canvas = Image::new(config.image_width, config.image_height);
        let generator = BytecodeGenerator::with_seed(
            config.image_width,
            config.image_height,
            DEFAULT_COMPOSITE_CHANCE,
            seed.wrapping_add(1),
        );
        Self {
            config,
            state,
            canvas,
            last_stats: ExecutionStats::default(),
            rng: SmallRng::seed_from_u64(seed),
            generator,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Statistics of the most recent execution.
    #[must_use]
    pub fn last_stats(&self) -> &ExecutionStats {
        &self.last_stats
    }

    /// Machine state left behind by the most recent execution.
    #[must_use]
    pub fn last_state(&self) -> &VmState {
        &self.state
    }

    /// Clears state, canvas, and statistics.
    pub fn reset(&mut self) {
        self.state = VmState::new(&self.config);
        self.canvas = Image::new(self.config.image_width, self.config.image_height);
        self.last_stats = ExecutionStats::default();
    }

    /// Executes `bytecode` against a fresh state and returns the canvas.
    pub fn execute(&mut self, bytecode: &[u8]) -> Image {
        self.reset();
        self.run(bytecode)
    }

    /// Executes `bytecode` starting from a caller-supplied state.
    pub fn execute_with_state(&mut self, bytecode: &[u8], initial_state: VmState) -> Image {
        self.state = initial_state;
        self.state.memory.resize(self.config.memory_size as usize, 0);
        self.canvas = Image::new(self.config.image_width, self.config.image_height);
        self.last_stats = ExecutionStats::default();
        self.run(bytecode)
    }

    fn run(&mut self, bytecode: &[u8]) -> Image {
        let copy = bytecode.len().min(self.state.memory.len());
        self.state.memory[..copy].copy_from_slice(&bytecode[..copy]);

        while self.state.running
            && self.state.pc < self.state.memory.len()
            && self.last_stats.instructions_executed < self.config.max_instructions
        {
            let opcode = self.state.memory[self.state.pc];
            let operand = self
                .state
                .memory
                .get(self.state.pc + 1)
                .copied()
                .unwrap_or(0);
            if !self.step(opcode, operand) {
                break;
            }
            self.last_stats.instructions_executed += 1;
        }

        self.last_stats.halted_normally = !self.state.running;
        self.canvas.clone()
    }

    /// Checks that every instruction is complete within the program and that
    /// no unknown opcode appears. Advisory: `execute` runs anything.
    #[must_use]
    pub fn validate(&self, bytecode: &[u8]) -> bool {
        if bytecode.is_empty() {
            return false;
        }
        let mut i = 0;
        while i < bytecode.len() {
            let Some(op) = Opcode::from_byte(bytecode[i]) else {
                return false;
            };
            let width = op.operand_width();
            if width > 0 && i + width >= bytecode.len() {
                return false;
            }
            i += 1 + width;
        }
        true
    }

    /// Address / hex / mnemonic listing of a program.
    #[must_use]
    pub fn disassemble(&self, bytecode: &[u8]) -> String {
        let mut listing = String::from("Disassembly:\n");
        let mut i = 0;
        while i < bytecode.len() {
            let byte = bytecode[i];
            let _ = write!(listing, "{i:04x}: {byte:02x} ");
            match Opcode::from_byte(byte) {
                Some(op) => {
                    listing.push_str(op.mnemonic());
                    if op.operand_width() == 1 {
                        if let Some(&operand) = bytecode.get(i + 1) {
                            let _ = write!(listing, " {operand}");
                            i += 1;
                        }
                    }
                }
                None => listing.push_str("UNKNOWN"),
            }
            listing.push('\n');
            i += 1;
        }
        listing
    }

    /// Produces a structured random program of exactly `size` bytes: the
    /// generator output is truncated or NOP-padded, and the final byte is
    /// always HALT.
    pub fn generate_random_bytecode(&mut self, size: usize) -> Vec<u8> {
        if size == 0 {
            return vec![Opcode::Halt.byte()];
        }
        // A color prelude plus one primitive averages around 16 bytes.
        let num_primitives = (size / 16).max(1);
        let mut bytecode = self.generator.generate_initial(num_primitives);
        bytecode.resize(size, Opcode::Nop.byte());
        if let Some(last) = bytecode.last_mut() {
            *last = Opcode::Halt.byte();
        }
        bytecode
    }

    fn fail(&mut self, message: &str) -> bool {
        self.last_stats.error_message = Some(message.to_string());
        false
    }

    fn push(&mut self, value: u8) -> bool {
        if self.state.stack.len() >= self.config.stack_size as usize {
            return false;
        }
        self.state.stack.push(value);
        true
    }

    fn pop(&mut self) -> Option<u8> {
        self.state.stack.pop()
    }

    fn peek(&self) -> Option<u8> {
        self.state.stack.last().copied()
    }

    fn binary(&mut self, op: fn(u8, u8) -> u8) -> bool {
        let Some(b) = self.pop() else {
            return self.fail("Stack underflow");
        };
        let Some(a) = self.pop() else {
            return self.fail("Stack underflow");
        };
        if !self.push(op(a, b)) {
            return self.fail("Stack overflow");
        }
        self.state.pc += 1;
        self.last_stats.stack_operations += 1;
        true
    }

    fn step(&mut self, opcode: u8, operand: u8) -> bool {
        let Some(opcode) = Opcode::from_byte(opcode) else {
            return self.fail(&format!("Unknown opcode: {opcode}"));
        };

        match opcode {
            Opcode::Nop => {
                self.state.pc += 1;
                true
            }
            Opcode::Push => {
                if !self.push(operand) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 2;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Pop => {
                if self.pop().is_none() {
                    return self.fail("Stack underflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Add => self.binary(u8::wrapping_add),
            Opcode::Sub => self.binary(u8::wrapping_sub),
            Opcode::Mul => self.binary(u8::wrapping_mul),
            Opcode::Div => {
                let Some(b) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(a) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                if b == 0 {
                    return self.fail("Division by zero");
                }
                if !self.push(a / b) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Mod => {
                let Some(b) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(a) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                if b == 0 {
                    return self.fail("Modulo by zero");
                }
                if !self.push(a % b) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::And => self.binary(|a, b| a & b),
            Opcode::Or => self.binary(|a, b| a | b),
            Opcode::Xor => self.binary(|a, b| a ^ b),
            Opcode::Not => {
                let Some(a) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                if !self.push(!a) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Jmp => {
                self.state.pc = operand as usize;
                true
            }
            Opcode::Jz => {
                let Some(top) = self.peek() else {
                    return self.fail("Stack underflow");
                };
                if top == 0 {
                    self.state.pc = operand as usize;
                } else {
                    self.state.pc += 2;
                }
                true
            }
            Opcode::Jnz => {
                let Some(top) = self.peek() else {
                    return self.fail("Stack underflow");
                };
                if top != 0 {
                    self.state.pc = operand as usize;
                } else {
                    self.state.pc += 2;
                }
                true
            }
            // CALL is an unconditional jump and RET a plain advance; the
            // genotype language deliberately has no call stack.
            Opcode::Call => {
                self.state.pc = operand as usize;
                true
            }
            Opcode::Ret => {
                self.state.pc += 1;
                true
            }
            Opcode::Load => {
                let address = operand as usize;
                if address >= self.state.memory.len() {
                    return self.fail("Memory access out of bounds");
                }
                let value = self.state.memory[address];
                if !self.push(value) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 2;
                self.last_stats.memory_operations += 1;
                true
            }
            Opcode::Store => {
                let Some(value) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let address = operand as usize;
                if address >= self.state.memory.len() {
                    return self.fail("Memory access out of bounds");
                }
                self.state.memory[address] = value;
                self.state.pc += 2;
                self.last_stats.memory_operations += 1;
                true
            }
            Opcode::DrawPixel => {
                let color = self.state.color;
                self.canvas.set_pixel(self.state.x, self.state.y, color);
                self.state.pc += 1;
                self.last_stats.pixels_drawn += 1;
                true
            }
            Opcode::SetX => {
                self.state.x = i32::from(operand);
                self.state.pc += 2;
                true
            }
            Opcode::SetY => {
                self.state.y = i32::from(operand);
                self.state.pc += 2;
                true
            }
            Opcode::SetColorR => {
                let Some(value) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                self.state.color[0] = value;
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::SetColorG => {
                let Some(value) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                self.state.color[1] = value;
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::SetColorB => {
                let Some(value) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                self.state.color[2] = value;
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Random => {
                let value: u8 = self.rng.random();
                if !self.push(value) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Dup => {
                let Some(top) = self.peek() else {
                    return self.fail("Stack underflow");
                };
                if !self.push(top) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Swap => {
                let Some(b) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(a) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                if !self.push(b) || !self.push(a) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::Rot => {
                let Some(c) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(b) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(a) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                if !self.push(b) || !self.push(c) || !self.push(a) {
                    return self.fail("Stack overflow");
                }
                self.state.pc += 1;
                self.last_stats.stack_operations += 1;
                true
            }
            Opcode::DrawCircle => {
                let Some(radius) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                self.draw_disk(i32::from(radius));
                self.state.pc += 1;
                self.last_stats.pixels_drawn += 1;
                true
            }
            Opcode::DrawRectangle => {
                let Some(h) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(w) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                self.draw_rectangle(i32::from(w), i32::from(h));
                self.state.pc += 1;
                self.last_stats.pixels_drawn += 1;
                true
            }
            Opcode::DrawLine => {
                let Some(y2) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(x2) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let (x, y) = (self.state.x, self.state.y);
                self.draw_line(x, y, i32::from(x2), i32::from(y2));
                self.state.pc += 1;
                self.last_stats.pixels_drawn += 1;
                true
            }
            Opcode::DrawBezierCurve => {
                let Some(ey) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(ex) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(cy) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(cx) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                self.draw_bezier(
                    i32::from(cx),
                    i32::from(cy),
                    i32::from(ex),
                    i32::from(ey),
                );
                self.state.pc += 1;
                self.last_stats.pixels_drawn += 1;
                true
            }
            Opcode::DrawTriangle => {
                let Some(y3) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(x3) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(y2) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(x2) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(y1) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let Some(x1) = self.pop() else {
                    return self.fail("Stack underflow");
                };
                let (x1, y1) = (i32::from(x1), i32::from(y1));
                let (x2, y2) = (i32::from(x2), i32::from(y2));
                let (x3, y3) = (i32::from(x3), i32::from(y3));
                self.draw_line(x1, y1, x2, y2);
                self.draw_line(x2, y2, x3, y3);
                self.draw_line(x3, y3, x1, y1);
                self.state.pc += 1;
                self.last_stats.pixels_drawn += 1;
                true
            }
            Opcode::Halt => {
                self.state.running = false;
                false
            }
        }
    }

    fn draw_disk(&mut self, radius: i32) {
        let color = self.state.color;
        let (cx, cy) = (self.state.x, self.state.y);
        let r_sq = radius * radius;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= r_sq {
                    self.canvas.set_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    fn draw_rectangle(&mut self, w: i32, h: i32) {
        let (x, y) = (self.state.x, self.state.y);
        self.draw_line(x, y, x + w, y);
        self.draw_line(x, y + h, x + w, y + h);
        self.draw_line(x, y, x, y + h);
        self.draw_line(x + w, y, x + w, y + h);
    }

    /// Bresenham's integer line algorithm.
    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) {
        let color = self.state.color;
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let (mut x, mut y) = (x0, y0);
        loop {
            self.canvas.set_pixel(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let doubled = 2 * err;
            if doubled >= dy {
                err += dy;
                x += sx;
            }
            if doubled <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Samples the quadratic curve at uniform t-steps and joins consecutive
    /// samples with line segments so the stroke has no gaps.
    fn draw_bezier(&mut self, cx: i32, cy: i32, ex: i32, ey: i32) {
        let (sx, sy) = (self.state.x, self.state.y);
        let mut prev = (sx, sy);
        for i in 1..=BEZIER_SEGMENTS {
            let t = f64::from(i) / f64::from(BEZIER_SEGMENTS);
            let u = 1.0 - t;
            let px = u * u * f64::from(sx) + 2.0 * u * t * f64::from(cx) + t * t * f64::from(ex);
            let py = u * u * f64::from(sy) + 2.0 * u * t * f64::from(cy) + t * t * f64::from(ey);
            let point = (px.round() as i32, py.round() as i32);
            self.draw_line(prev.0, prev.1, point.0, point.1);
            prev = point;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> BytecodeVm {
        BytecodeVm::with_seed(VmConfig::default(), 0xC0FFEE)
    }

    fn program(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn push_add_leaves_sum_on_stack() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 10],
            &[Opcode::Push.byte(), 20],
            &[Opcode::Add.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![30]);
        assert!(vm.last_stats().halted_normally);
        assert_eq!(vm.last_stats().error_message, None);
    }

    #[test]
    fn sub_operand_order_is_a_minus_b() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 20],
            &[Opcode::Push.byte(), 10],
            &[Opcode::Sub.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![10]);
    }

    #[test]
    fn arithmetic_wraps_at_byte_width() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 200],
            &[Opcode::Push.byte(), 100],
            &[Opcode::Add.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![44]);
    }

    #[test]
    fn division_by_zero_faults_with_message() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 10],
            &[Opcode::Push.byte(), 0],
            &[Opcode::Div.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert!(!vm.last_stats().halted_normally);
        assert_eq!(
            vm.last_stats().error_message.as_deref(),
            Some("Division by zero")
        );
    }

    #[test]
    fn modulo_by_zero_faults_with_message() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 10],
            &[Opcode::Push.byte(), 0],
            &[Opcode::Mod.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(
            vm.last_stats().error_message.as_deref(),
            Some("Modulo by zero")
        );
    }

    #[test]
    fn pop_on_empty_stack_underflows() {
        let mut vm = vm();
        let code = program(&[&[Opcode::Pop.byte()], &[Opcode::Halt.byte()]]);
        vm.execute(&code);
        assert_eq!(
            vm.last_stats().error_message.as_deref(),
            Some("Stack underflow")
        );
        assert!(!vm.last_stats().halted_normally);
    }

    #[test]
    fn push_beyond_capacity_overflows() {
        let config = VmConfig {
            stack_size: 2,
            ..VmConfig::default()
        };
        let mut vm = BytecodeVm::with_seed(config, 1);
        let code = program(&[
            &[Opcode::Push.byte(), 1],
            &[Opcode::Push.byte(), 2],
            &[Opcode::Push.byte(), 3],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(
            vm.last_stats().error_message.as_deref(),
            Some("Stack overflow")
        );
    }

    #[test]
    fn jmp_skips_instructions() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Jmp.byte(), 4],
            &[Opcode::Push.byte(), 1],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert!(vm.last_state().stack.is_empty());
        assert!(vm.last_stats().halted_normally);
    }

    #[test]
    fn jz_peeks_without_popping() {
        let mut vm = vm();
        // JZ with a zero on top jumps straight to HALT; the zero stays.
        let code = program(&[
            &[Opcode::Push.byte(), 0],
            &[Opcode::Jz.byte(), 6],
            &[Opcode::Push.byte(), 9],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![0]);
    }

    #[test]
    fn jnz_falls_through_on_zero() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 0],
            &[Opcode::Jnz.byte(), 0],
            &[Opcode::Push.byte(), 5],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![0, 5]);
    }

    #[test]
    fn call_jumps_and_ret_advances() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Call.byte(), 3],
            &[Opcode::Halt.byte()],
            &[Opcode::Ret.byte()],
            &[Opcode::Push.byte(), 7],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![7]);
    }

    #[test]
    fn load_store_round_trip() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 42],
            &[Opcode::Store.byte(), 200],
            &[Opcode::Load.byte(), 200],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![42]);
        assert_eq!(vm.last_stats().memory_operations, 2);
    }

    #[test]
    fn stack_shuffles_behave() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 1],
            &[Opcode::Push.byte(), 2],
            &[Opcode::Push.byte(), 3],
            &[Opcode::Rot.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![2, 3, 1]);

        let code = program(&[
            &[Opcode::Push.byte(), 1],
            &[Opcode::Push.byte(), 2],
            &[Opcode::Swap.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![2, 1]);

        let code = program(&[
            &[Opcode::Push.byte(), 4],
            &[Opcode::Dup.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute(&code);
        assert_eq!(vm.last_state().stack, vec![4, 4]);
    }

    #[test]
    fn draw_pixel_writes_current_color() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 10],
            &[Opcode::SetColorR.byte()],
            &[Opcode::Push.byte(), 20],
            &[Opcode::SetColorG.byte()],
            &[Opcode::Push.byte(), 30],
            &[Opcode::SetColorB.byte()],
            &[Opcode::SetX.byte(), 5],
            &[Opcode::SetY.byte(), 6],
            &[Opcode::DrawPixel.byte()],
            &[Opcode::Halt.byte()],
        ]);
        let image = vm.execute(&code);
        assert_eq!(image.get(5, 6), Some([10, 20, 30]));
        assert_eq!(vm.last_stats().pixels_drawn, 1);
    }

    #[test]
    fn out_of_canvas_draws_are_skipped() {
        let config = VmConfig {
            image_width: 8,
            image_height: 8,
            ..VmConfig::default()
        };
        let mut vm = BytecodeVm::with_seed(config, 1);
        let code = program(&[
            &[Opcode::Push.byte(), 255],
            &[Opcode::SetColorR.byte()],
            &[Opcode::SetX.byte(), 200],
            &[Opcode::SetY.byte(), 200],
            &[Opcode::DrawPixel.byte()],
            &[Opcode::Halt.byte()],
        ]);
        let image = vm.execute(&code);
        assert!(image.data().iter().all(|&b| b == 0));
        assert!(vm.last_stats().halted_normally);
    }

    #[test]
    fn draw_circle_fills_a_disk() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 255],
            &[Opcode::SetColorG.byte()],
            &[Opcode::SetX.byte(), 100],
            &[Opcode::SetY.byte(), 100],
            &[Opcode::Push.byte(), 5],
            &[Opcode::DrawCircle.byte()],
            &[Opcode::Halt.byte()],
        ]);
        let image = vm.execute(&code);
        assert_eq!(image.get(100, 100), Some([0, 255, 0]));
        assert_eq!(image.get(104, 100), Some([0, 255, 0]));
        assert_eq!(image.get(100, 107), Some([0, 0, 0]));
    }

    #[test]
    fn draw_line_connects_endpoints() {
        let mut vm = vm();
        let code = program(&[
            &[Opcode::Push.byte(), 255],
            &[Opcode::SetColorB.byte()],
            &[Opcode::SetX.byte(), 10],
            &[Opcode::SetY.byte(), 10],
            &[Opcode::Push.byte(), 20],
            &[Opcode::Push.byte(), 10],
            &[Opcode::DrawLine.byte()],
            &[Opcode::Halt.byte()],
        ]);
        let image = vm.execute(&code);
        for x in 10..=20 {
            assert_eq!(image.get(x, 10), Some([0, 0, 255]), "x = {x}");
        }
    }

    #[test]
    fn unknown_opcode_faults() {
        let mut vm = vm();
        let code = vec![0x7Fu8, Opcode::Halt.byte()];
        vm.execute(&code);
        assert_eq!(
            vm.last_stats().error_message.as_deref(),
            Some("Unknown opcode: 127")
        );
    }

    #[test]
    fn instruction_budget_is_enforced() {
        let config = VmConfig {
            max_instructions: 16,
            ..VmConfig::default()
        };
        let mut vm = BytecodeVm::with_seed(config, 1);
        // No HALT: NOP-filled memory runs until the budget trips.
        vm.execute(&[Opcode::Nop.byte()]);
        assert_eq!(vm.last_stats().instructions_executed, 16);
        assert!(!vm.last_stats().halted_normally);
    }

    #[test]
    fn empty_bytecode_yields_blank_canvas() {
        let mut vm = vm();
        let image = vm.execute(&[]);
        assert_eq!(image.width(), 256);
        assert_eq!(image.height(), 256);
        assert!(image.data().iter().all(|&b| b == 0));
        assert!(!vm.last_stats().halted_normally);
    }

    #[test]
    fn validate_rejects_truncated_and_unknown() {
        let vm = vm();
        assert!(!vm.validate(&[]));
        assert!(!vm.validate(&[Opcode::Push.byte()]));
        assert!(!vm.validate(&[0x30, Opcode::Halt.byte()]));
        assert!(vm.validate(&[Opcode::Push.byte(), 1, Opcode::Halt.byte()]));
    }

    #[test]
    fn disassembly_lists_mnemonics_and_operands() {
        let vm = vm();
        let listing = vm.disassemble(&[Opcode::Push.byte(), 100, Opcode::Halt.byte()]);
        assert!(listing.contains("0000: 01 PUSH 100"));
        assert!(listing.contains("0002: ff HALT"));
    }

    #[test]
    fn generated_bytecode_has_exact_size_and_halt() {
        let mut vm = vm();
        for size in [1usize, 16, 64, 300] {
            let code = vm.generate_random_bytecode(size);
            assert_eq!(code.len(), size);
            assert_eq!(code.last(), Some(&Opcode::Halt.byte()));
        }
    }

    #[test]
    fn execute_with_state_seeds_the_machine() {
        let mut vm = vm();
        let mut state = VmState::new(vm.config());
        state.stack.push(41);
        let code = program(&[
            &[Opcode::Push.byte(), 1],
            &[Opcode::Add.byte()],
            &[Opcode::Halt.byte()],
        ]);
        vm.execute_with_state(&code, state);
        assert_eq!(vm.last_state().stack, vec![42]);
    }

    #[test]
    fn channel_std_dev_is_zero_on_blank() {
        let image = Image::new(16, 16);
        assert_eq!(image.channel_std_dev(), [0.0; 3]);
    }
}
