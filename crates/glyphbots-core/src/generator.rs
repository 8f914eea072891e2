//! Structured bytecode generation for seeding populations.
//!
//! Purely random byte soup almost never draws anything, so initial genomes
//! are assembled from a small library of drawing primitives and composites,
//! each prefixed with a non-black color prelude so the result is visible on
//! the black canvas.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::opcode::Opcode;

/// Default probability that a generated unit is a composite rather than a
/// single primitive.
pub const DEFAULT_COMPOSITE_CHANCE: f64 = 0.25;

const PRIMITIVE_KINDS: u32 = 5;

/// Builds well-formed drawing programs with randomized, in-canvas parameters.
#[derive(Debug)]
pub struct BytecodeGenerator {
    image_width: u32,
    image_height: u32,
    composite_chance: f64,
    rng: SmallRng,
}

impl BytecodeGenerator {
    /// Creates a generator seeded from entropy.
    #[must_use]
    pub fn new(image_width: u32, image_height: u32, composite_chance: f64) -> Self {
        let seed: u64 = rand::random();
        Self::with_seed(image_width, image_height, composite_chance, seed)
    }

    /// Creates a generator with a fixed seed for reproducible programs.
    #[must_use]
    pub fn with_seed(image_width: u32, image_height: u32, composite_chance: f64, seed: u64) -> Self {
        Self {
            image_width: image_width.max(1),
            image_height: image_height.max(1),
            composite_chance,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Assembles `num_primitives` randomly chosen units (primitives or
    /// composites) and terminates the program with HALT.
    pub fn generate_initial(&mut self, num_primitives: usize) -> Vec<u8> {
        let mut bytecode = Vec::new();
        for _ in 0..num_primitives {
            let unit = if self.rng.random::<f64>() < self.composite_chance {
                self.stick_figure()
            } else {
                match self.rng.random_range(0..PRIMITIVE_KINDS) {
                    0 => self.circle_primitive(),
                    1 => self.rectangle_primitive(),
                    2 => self.line_primitive(),
                    3 => self.bezier_primitive(),
                    _ => self.triangle_primitive(),
                }
            };
            bytecode.extend_from_slice(&unit);
        }
        bytecode.push(Opcode::Halt.byte());
        bytecode
    }

    /// A filled circle in a random non-black color.
    pub fn circle_primitive(&mut self) -> Vec<u8> {
        let mut bytecode = self.color_prelude();
        let x = self.random_coord(true);
        let y = self.random_coord(false);
        let radius = self.random_non_zero_byte() / 8 + 10;
        bytecode.extend_from_slice(&Self::circle(x, y, radius));
        bytecode
    }

    /// A rectangle outline in a random non-black color.
    pub fn rectangle_primitive(&mut self) -> Vec<u8> {
        let mut bytecode = self.color_prelude();
        let x = self.random_coord(true);
        let y = self.random_coord(false);
        let w = self.random_byte() / 4 + 5;
        let h = self.random_byte() / 4 + 5;
        bytecode.extend_from_slice(&Self::rectangle(x, y, w, h));
        bytecode
    }

    /// A line segment in a random non-black color.
    pub fn line_primitive(&mut self) -> Vec<u8> {
        let mut bytecode = self.color_prelude();
        let x1 = self.random_coord(true);
        let y1 = self.random_coord(false);
        let x2 = self.random_coord(true);
        let y2 = self.random_coord(false);
        bytecode.extend_from_slice(&Self::line(x1, y1, x2, y2));
        bytecode
    }

    /// A quadratic Bézier curve in a random non-black color.
    pub fn bezier_primitive(&mut self) -> Vec<u8> {
        let mut bytecode = self.color_prelude();
        let x0 = self.random_coord(true);
        let y0 = self.random_coord(false);
        let cx = self.random_coord(true);
        let cy = self.random_coord(false);
        let ex = self.random_coord(true);
        let ey = self.random_coord(false);
        bytecode.extend_from_slice(&Self::bezier_curve(x0, y0, cx, cy, ex, ey));
        bytecode
    }

    /// A triangle outline in a random non-black color.
    pub fn triangle_primitive(&mut self) -> Vec<u8> {
        let mut bytecode = self.color_prelude();
        let x1 = self.random_coord(true);
        let y1 = self.random_coord(false);
        let x2 = self.random_coord(true);
        let y2 = self.random_coord(false);
        let x3 = self.random_coord(true);
        let y3 = self.random_coord(false);
        bytecode.extend_from_slice(&Self::triangle(x1, y1, x2, y2, x3, y3));
        bytecode
    }

    /// Composite: a head circle plus torso, arms, and legs anchored at a
    /// random center, with all coordinates clamped into operand range.
    pub fn stick_figure(&mut self) -> Vec<u8> {
        let mut bytecode = self.color_prelude();

        let head_radius = i32::from(self.random_non_zero_byte() / 16 + 8);
        let torso_length = head_radius * 2;
        let limb_length = head_radius;

        let center_x = i32::from(self.random_coord(true));
        let center_y = i32::from(self.random_coord(false));

        let clamp = |value: i32| value.clamp(0, 255) as u8;

        let head_x = clamp(center_x);
        let head_y = clamp(center_y - torso_length / 2);
        let torso_top_y = clamp(i32::from(head_y) + head_radius);
        let torso_bottom_y = clamp(i32::from(torso_top_y) + torso_length);
        let arm_y = clamp(i32::from(torso_top_y) + torso_length / 4);

        bytecode.extend_from_slice(&Self::circle(head_x, head_y, clamp(head_radius)));
        bytecode.extend_from_slice(&Self::line(head_x, torso_top_y, head_x, torso_bottom_y));
        bytecode.extend_from_slice(&Self::line(
            head_x,
            arm_y,
            clamp(i32::from(head_x) - limb_length),
            clamp(i32::from(arm_y) + limb_length / 2),
        ));
        bytecode.extend_from_slice(&Self::line(
            head_x,
            arm_y,
            clamp(i32::from(head_x) + limb_length),
            clamp(i32::from(arm_y) + limb_length / 2),
        ));
        bytecode.extend_from_slice(&Self::line(
            head_x,
            torso_bottom_y,
            clamp(i32::from(head_x) - limb_length),
            clamp(i32::from(torso_bottom_y) + limb_length),
        ));
        bytecode.extend_from_slice(&Self::line(
            head_x,
            torso_bottom_y,
            clamp(i32::from(head_x) + limb_length),
            clamp(i32::from(torso_bottom_y) + limb_length),
        ));
        bytecode
    }

    /// Instruction sequence for a filled circle at `(x, y)`.
    #[must_use]
    pub fn circle(x: u8, y: u8, radius: u8) -> Vec<u8> {
        vec![
            Opcode::SetX.byte(),
            x,
            Opcode::SetY.byte(),
            y,
            Opcode::Push.byte(),
            radius,
            Opcode::DrawCircle.byte(),
        ]
    }

    /// Instruction sequence for a `w × h` rectangle anchored at `(x, y)`.
    #[must_use]
    pub fn rectangle(x: u8, y: u8, w: u8, h: u8) -> Vec<u8> {
        vec![
            Opcode::SetX.byte(),
            x,
            Opcode::SetY.byte(),
            y,
            Opcode::Push.byte(),
            w,
            Opcode::Push.byte(),
            h,
            Opcode::DrawRectangle.byte(),
        ]
    }

    /// Instruction sequence for a line from `(x1, y1)` to `(x2, y2)`.
    #[must_use]
    pub fn line(x1: u8, y1: u8, x2: u8, y2: u8) -> Vec<u8> {
        vec![
            Opcode::SetX.byte(),
            x1,
            Opcode::SetY.byte(),
            y1,
            Opcode::Push.byte(),
            x2,
            Opcode::Push.byte(),
            y2,
            Opcode::DrawLine.byte(),
        ]
    }

    /// Instruction sequence for a triangle over three vertices.
    #[must_use]
    pub fn triangle(x1: u8, y1: u8, x2: u8, y2: u8, x3: u8, y3: u8) -> Vec<u8> {
        vec![
            Opcode::Push.byte(),
            x1,
            Opcode::Push.byte(),
            y1,
            Opcode::Push.byte(),
            x2,
            Opcode::Push.byte(),
            y2,
            Opcode::Push.byte(),
            x3,
            Opcode::Push.byte(),
            y3,
            Opcode::DrawTriangle.byte(),
        ]
    }

    /// Instruction sequence for a quadratic Bézier from `(x0, y0)` through
    /// control `(cx, cy)` to `(ex, ey)`.
    #[must_use]
    pub fn bezier_curve(x0: u8, y0: u8, cx: u8, cy: u8, ex: u8, ey: u8) -> Vec<u8> {
        vec![
            Opcode::SetX.byte(),
            x0,
            Opcode::SetY.byte(),
            y0,
            Opcode::Push.byte(),
            cx,
            Opcode::Push.byte(),
            cy,
            Opcode::Push.byte(),
            ex,
            Opcode::Push.byte(),
            ey,
            Opcode::DrawBezierCurve.byte(),
        ]
    }

    /// Emits PUSH/SET_COLOR_* instructions for a random color with at least
    /// one non-zero channel.
    pub fn color_prelude(&mut self) -> Vec<u8> {
        let r = self.random_byte();
        let g = self.random_byte();
        let mut b = self.random_byte();
        if r == 0 && g == 0 && b == 0 {
            b = 128;
        }
        vec![
            Opcode::Push.byte(),
            r,
            Opcode::SetColorR.byte(),
            Opcode::Push.byte(),
            g,
            Opcode::SetColorG.byte(),
            Opcode::Push.byte(),
            b,
            Opcode::SetColorB.byte(),
        ]
    }

    fn random_byte(&mut self) -> u8 {
        self.rng.random()
    }

    fn random_non_zero_byte(&mut self) -> u8 {
        self.rng.random_range(1..=255)
    }

    fn random_coord(&mut self, horizontal: bool) -> u8 {
        let extent = if horizontal {
            self.image_width
        } else {
            self.image_height
        };
        self.rng.random_range(0..extent.min(256)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{BytecodeVm, VmConfig};

    fn generator(seed: u64) -> BytecodeGenerator {
        BytecodeGenerator::with_seed(256, 256, DEFAULT_COMPOSITE_CHANCE, seed)
    }

    #[test]
    fn initial_bytecode_ends_with_halt() {
        let mut generator = generator(7);
        let bytecode = generator.generate_initial(4);
        assert_eq!(bytecode.last(), Some(&Opcode::Halt.byte()));
    }

    #[test]
    fn initial_bytecode_always_validates() {
        let vm = BytecodeVm::with_seed(VmConfig::default(), 1);
        for seed in 0..32 {
            let mut generator = generator(seed);
            let count = (seed as usize % 7) + 1;
            let bytecode = generator.generate_initial(count);
            assert!(vm.validate(&bytecode), "seed {seed} produced invalid code");
        }
    }

    #[test]
    fn zero_primitives_is_a_bare_halt() {
        let mut generator = generator(3);
        assert_eq!(generator.generate_initial(0), vec![Opcode::Halt.byte()]);
    }

    #[test]
    fn color_prelude_is_never_black() {
        for seed in 0..64 {
            let mut generator = generator(seed);
            let prelude = generator.color_prelude();
            let channels = [prelude[1], prelude[4], prelude[7]];
            assert!(channels.iter().any(|&c| c != 0), "seed {seed} was black");
        }
    }

    #[test]
    fn primitives_draw_visible_pixels() {
        let mut vm = BytecodeVm::with_seed(VmConfig::default(), 9);
        let mut generator = generator(11);
        let mut bytecode = generator.circle_primitive();
        bytecode.push(Opcode::Halt.byte());
        let image = vm.execute(&bytecode);
        assert!(image.data().iter().any(|&byte| byte != 0));
    }

    #[test]
    fn stick_figure_coordinates_fit_operands() {
        for seed in 0..16 {
            let mut generator = generator(seed);
            let bytecode = generator.stick_figure();
            let vm = BytecodeVm::with_seed(VmConfig::default(), 1);
            let mut terminated = bytecode.clone();
            terminated.push(Opcode::Halt.byte());
            assert!(vm.validate(&terminated));
        }
    }
}
