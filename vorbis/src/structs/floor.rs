//! Floor curve setup and synthesis.
//!
//! A floor describes the coarse spectral envelope for one channel of one
//! audio packet. Type 0 encodes an LSP filter evaluated along a Bark-scale
//! curve; type 1 encodes a piecewise-linear curve in dB space rendered
//! through an inverse-dB lookup. Both multiply the envelope into the channel
//! residue in place.
//!
//! Per-channel decode state lives in [`FloorData`] owned by the caller, so a
//! single floor definition serves every channel.

use crate::structs::codebook::Codebook;
use crate::structs::packet::{BitCursor, ByteSource};
use crate::utils::bits::ilog;
use crate::utils::errors::FloorError;

/// One floor definition from the setup header.
#[derive(Debug, Clone)]
pub enum Floor {
    Zero(Floor0),
    One(Floor1),
}

/// Per-channel floor state for one packet.
#[derive(Debug, Clone)]
pub struct FloorData {
    pub block_size: usize,
    pub force_energy: bool,
    pub force_no_energy: bool,
    kind: FloorDataKind,
}

#[derive(Debug, Clone)]
enum FloorDataKind {
    Zero { amp: f32, coeff: Vec<f32> },
    One { posts: [i32; 64], post_count: usize },
}

impl FloorData {
    fn has_energy(&self) -> bool {
        match &self.kind {
            FloorDataKind::Zero { amp, .. } => *amp > 0.0,
            FloorDataKind::One { post_count, .. } => *post_count > 0,
        }
    }

    /// Whether this channel carries audio this packet.
    pub fn execute_channel(&self) -> bool {
        (self.force_energy | self.has_energy()) & !self.force_no_energy
    }
}

impl Floor {
    pub fn read<S: ByteSource>(
        reader: &mut BitCursor<S>,
        block0_size: usize,
        block1_size: usize,
        books: &[Codebook],
    ) -> Result<Self, FloorError> {
        let floor_type = reader.read_bits(16) as u16;
        match floor_type {
            0 => Ok(Self::Zero(Floor0::read(
                reader,
                block0_size,
                block1_size,
                books,
            )?)),
            1 => Ok(Self::One(Floor1::read(reader, books)?)),
            other => Err(FloorError::UnsupportedType(other)),
        }
    }

    pub fn create_data(&self) -> FloorData {
        let kind = match self {
            Self::Zero(floor) => FloorDataKind::Zero {
                amp: 0.0,
                coeff: vec![0.0; floor.order + 1],
            },
            Self::One(_) => FloorDataKind::One {
                posts: [0; 64],
                post_count: 0,
            },
        };
        FloorData {
            block_size: 0,
            force_energy: false,
            force_no_energy: false,
            kind,
        }
    }

    pub fn unpack<S: ByteSource>(
        &self,
        reader: &mut BitCursor<S>,
        block_size: usize,
        data: &mut FloorData,
        books: &[Codebook],
    ) {
        data.block_size = block_size;
        data.force_energy = false;
        data.force_no_energy = false;
        match (self, &mut data.kind) {
            (Self::Zero(floor), FloorDataKind::Zero { amp, coeff }) => {
                floor.unpack(reader, amp, coeff, books);
            }
            (Self::One(floor), FloorDataKind::One { posts, post_count }) => {
                floor.unpack(reader, posts, post_count, books);
            }
            _ => unreachable!("floor data kind mismatch"),
        }
    }

    pub fn apply(&self, data: &mut FloorData, residue: &mut [f32]) {
        let n = data.block_size / 2;
        match (self, &mut data.kind) {
            (Self::Zero(floor), FloorDataKind::Zero { amp, coeff }) => {
                floor.apply(*amp, coeff, data.block_size, residue);
            }
            (Self::One(floor), FloorDataKind::One { posts, post_count }) => {
                floor.apply(posts, *post_count, n, residue);
            }
            _ => unreachable!("floor data kind mismatch"),
        }
    }
}

/// LSP filter floor.
#[derive(Debug, Clone)]
pub struct Floor0 {
    order: usize,
    rate: u32,
    bark_map_size: u32,
    amp_bits: u32,
    amp_ofs: u32,
    amp_div: u32,
    books: Vec<usize>,
    book_bits: u32,

    block0_size: usize,
    bark_maps: [Vec<i32>; 2],
    w_maps: [Vec<f32>; 2],
}

impl Floor0 {
    fn read<S: ByteSource>(
        reader: &mut BitCursor<S>,
        block0_size: usize,
        block1_size: usize,
        books: &[Codebook],
    ) -> Result<Self, FloorError> {
        let order = reader.read_bits(8) as usize;
        let rate = reader.read_bits(16) as u32;
        let bark_map_size = reader.read_bits(16) as u32;
        let amp_bits = reader.read_bits(6) as u32;
        let amp_ofs = reader.read_bits(8) as u32;
        let book_count = reader.read_bits(4) as usize + 1;

        if order < 1 || rate < 1 || bark_map_size < 1 {
            return Err(FloorError::InvalidParameters);
        }

        let amp_div = (1u32 << amp_bits) - 1;

        let mut book_nums = Vec::with_capacity(book_count);
        for _ in 0..book_count {
            let num = reader.read_bits(8) as usize;
            let book = books.get(num).ok_or(FloorError::InvalidBook(num as u8))?;
            if !book.has_lookup() || book.dimensions < 1 {
                return Err(FloorError::InvalidBook(num as u8));
            }
            book_nums.push(num);
        }
        let book_bits = ilog(book_count as u32);

        let mut floor = Self {
            order,
            rate,
            bark_map_size,
            amp_bits,
            amp_ofs,
            amp_div,
            books: book_nums,
            book_bits,
            block0_size,
            bark_maps: [Vec::new(), Vec::new()],
            w_maps: [Vec::new(), Vec::new()],
        };
        floor.bark_maps = [
            floor.synthesize_bark_curve(block0_size / 2),
            floor.synthesize_bark_curve(block1_size / 2),
        ];
        floor.w_maps = [
            floor.synthesize_wdel_map(block0_size / 2),
            floor.synthesize_wdel_map(block1_size / 2),
        ];
        Ok(floor)
    }

    fn synthesize_bark_curve(&self, n: usize) -> Vec<i32> {
        let scale = self.bark_map_size as f64 / to_bark((self.rate / 2) as f64) as f64;

        let mut map = vec![0i32; n + 1];
        for (i, slot) in map.iter_mut().enumerate().take(n.saturating_sub(1)) {
            let bark = to_bark((self.rate as f32 / 2.0) as f64 / n as f64 * i as f64);
            *slot = ((bark as f64 * scale).floor() as i32).min(self.bark_map_size as i32 - 1);
        }
        map[n] = -1;
        map
    }

    fn synthesize_wdel_map(&self, n: usize) -> Vec<f32> {
        let wdel = std::f64::consts::PI / self.bark_map_size as f64;
        // indexed by bark number, which may run past n on odd configurations
        let len = n.max(self.bark_map_size as usize);
        (0..len)
            .map(|i| 2.0 * (wdel * i as f64).cos() as f32)
            .collect()
    }

    fn maps_for(&self, block_size: usize) -> (&[i32], &[f32]) {
        let idx = usize::from(block_size != self.block0_size);
        (&self.bark_maps[idx], &self.w_maps[idx])
    }

    fn unpack<S: ByteSource>(
        &self,
        reader: &mut BitCursor<S>,
        amp: &mut f32,
        coeff: &mut [f32],
        books: &[Codebook],
    ) {
        *amp = reader.read_bits(self.amp_bits) as f32;
        if *amp <= 0.0 {
            return;
        }

        coeff.fill(0.0);
        *amp = *amp / self.amp_div as f32 * self.amp_ofs as f32;

        let book_num = reader.read_bits(self.book_bits) as usize;
        let Some(&book_idx) = self.books.get(book_num) else {
            // ran out of data or the packet is corrupt, zero the floor
            *amp = 0.0;
            return;
        };
        let book = &books[book_idx];

        let mut i = 0;
        while i < self.order {
            let Some(entry) = book.decode_scalar(reader) else {
                *amp = 0.0;
                return;
            };
            let vector = book.vector(entry as usize);
            for &value in vector.iter().take(self.order - i) {
                coeff[i] = value;
                i += 1;
            }
        }

        // accumulate each vector's last value into the following vectors
        let mut last = 0.0f32;
        let mut j = 0;
        while j < self.order {
            let span = book.dimensions.min(self.order - j);
            for c in coeff[j..j + span].iter_mut() {
                *c += last;
            }
            j += span;
            last = coeff[j - 1];
        }
    }

    fn apply(&self, amp: f32, coeff: &mut [f32], block_size: usize, residue: &mut [f32]) {
        let n = block_size / 2;

        if amp > 0.0 {
            let (bark_map, w_map) = self.maps_for(block_size);

            for c in coeff.iter_mut().take(self.order) {
                *c = 2.0 * c.cos();
            }

            let mut i = 0;
            while i < n {
                let k = bark_map[i];
                let mut p = 0.5f32;
                let mut q = 0.5f32;
                let w = w_map[k as usize];
                let mut j = 1;
                while j < self.order {
                    q *= w - coeff[j - 1];
                    p *= w - coeff[j];
                    j += 2;
                }
                if j == self.order {
                    // odd order filter, slightly asymmetric
                    q *= w - coeff[j - 1];
                    p *= p * (4.0 - w * w);
                    q *= q;
                } else {
                    p *= p * (2.0 - w);
                    q *= q * (2.0 + w);
                }

                // dB of this bark section, then a linear multiplier
                let mut q = amp / (p + q).sqrt() - self.amp_ofs as f32;
                q = (q * 0.115_129_25f32).exp();

                residue[i] *= q;
                i += 1;
                while bark_map[i] == k {
                    residue[i] *= q;
                    i += 1;
                }
            }
        } else {
            residue[..n].fill(0.0);
        }
    }
}

/// Piecewise-linear dB floor.
#[derive(Debug, Clone)]
pub struct Floor1 {
    partition_class: Vec<usize>,
    class_dimensions: Vec<usize>,
    class_subclasses: Vec<u32>,
    class_masterbooks: Vec<Option<usize>>,
    subclass_books: Vec<Vec<Option<usize>>>,
    multiplier: i32,
    range: i32,
    y_bits: u32,
    x_list: Vec<i32>,
    l_neigh: Vec<usize>,
    h_neigh: Vec<usize>,
    sort_idx: Vec<usize>,
}

const RANGE_LOOKUP: [i32; 4] = [256, 128, 86, 64];
const Y_BITS_LOOKUP: [u32; 4] = [8, 7, 7, 6];

impl Floor1 {
    fn read<S: ByteSource>(
        reader: &mut BitCursor<S>,
        books: &[Codebook],
    ) -> Result<Self, FloorError> {
        let partition_count = reader.read_bits(5) as usize;
        let partition_class: Vec<usize> = (0..partition_count)
            .map(|_| reader.read_bits(4) as usize)
            .collect();

        let maximum_class = partition_class.iter().copied().max().map_or(0, |m| m + 1);
        let mut class_dimensions = Vec::with_capacity(maximum_class);
        let mut class_subclasses = Vec::with_capacity(maximum_class);
        let mut class_masterbooks = Vec::with_capacity(maximum_class);
        let mut subclass_books = Vec::with_capacity(maximum_class);
        for _ in 0..maximum_class {
            class_dimensions.push(reader.read_bits(3) as usize + 1);
            let subclasses = reader.read_bits(2) as u32;
            class_subclasses.push(subclasses);

            if subclasses > 0 {
                let num = reader.read_bits(8) as usize;
                if num >= books.len() {
                    return Err(FloorError::InvalidClassBook(num as u8));
                }
                class_masterbooks.push(Some(num));
            } else {
                class_masterbooks.push(None);
            }

            let mut subs = Vec::with_capacity(1 << subclasses);
            for _ in 0..1usize << subclasses {
                let num = reader.read_bits(8) as i32 - 1;
                if num >= 0 {
                    if num as usize >= books.len() {
                        return Err(FloorError::InvalidClassBook(num as u8));
                    }
                    subs.push(Some(num as usize));
                } else {
                    subs.push(None);
                }
            }
            subclass_books.push(subs);
        }

        let multiplier_idx = reader.read_bits(2) as usize;
        let range = RANGE_LOOKUP[multiplier_idx];
        let y_bits = Y_BITS_LOOKUP[multiplier_idx];
        let multiplier = multiplier_idx as i32 + 1;

        let range_bits = reader.read_bits(4) as u32;

        let mut x_list: Vec<i32> = vec![0, 1 << range_bits];
        for &class_num in &partition_class {
            for _ in 0..class_dimensions[class_num] {
                x_list.push(reader.read_bits(range_bits) as i32);
            }
        }
        if x_list.len() > 64 {
            return Err(FloorError::TooManyPoints(x_list.len()));
        }

        // low and high neighbor per point, plus the x-sorted order
        let count = x_list.len();
        let mut l_neigh = vec![0usize; count];
        let mut h_neigh = vec![0usize; count];
        let mut sort_idx: Vec<usize> = (0..count).collect();
        for i in 2..count {
            l_neigh[i] = 0;
            h_neigh[i] = 1;
            for j in 2..i {
                let temp = x_list[j];
                if temp < x_list[i] {
                    if temp > x_list[l_neigh[i]] {
                        l_neigh[i] = j;
                    }
                } else if temp < x_list[h_neigh[i]] {
                    h_neigh[i] = j;
                }
            }
        }

        for i in 0..count {
            for j in i + 1..count {
                if x_list[i] == x_list[j] {
                    return Err(FloorError::DuplicatePoint(x_list[i] as u32));
                }
                if x_list[sort_idx[i]] > x_list[sort_idx[j]] {
                    sort_idx.swap(i, j);
                }
            }
        }

        Ok(Self {
            partition_class,
            class_dimensions,
            class_subclasses,
            class_masterbooks,
            subclass_books,
            multiplier,
            range,
            y_bits,
            x_list,
            l_neigh,
            h_neigh,
            sort_idx,
        })
    }

    fn unpack<S: ByteSource>(
        &self,
        reader: &mut BitCursor<S>,
        posts: &mut [i32; 64],
        post_count: &mut usize,
        books: &[Codebook],
    ) {
        *post_count = 0;
        posts.fill(0);

        if !reader.read_bit() {
            return;
        }

        let mut count = 2;
        posts[0] = reader.read_bits(self.y_bits) as i32;
        posts[1] = reader.read_bits(self.y_bits) as i32;

        'partitions: for &cls_num in &self.partition_class {
            let cdim = self.class_dimensions[cls_num];
            let cbits = self.class_subclasses[cls_num];
            let csub = (1u32 << cbits) - 1;
            let mut cval = 0u32;
            if cbits > 0 {
                let Some(book_idx) = self.class_masterbooks[cls_num] else {
                    count = 0;
                    break 'partitions;
                };
                match books[book_idx].decode_scalar(reader) {
                    Some(value) => cval = value,
                    None => {
                        count = 0;
                        break 'partitions;
                    }
                }
            }
            for _ in 0..cdim {
                let book = self.subclass_books[cls_num][(cval & csub) as usize];
                cval >>= cbits;
                if let Some(book_idx) = book {
                    match books[book_idx].decode_scalar(reader) {
                        Some(value) => posts[count] = value as i32,
                        None => {
                            count = 0;
                            break 'partitions;
                        }
                    }
                }
                count += 1;
            }
        }

        *post_count = count;
    }

    fn apply(&self, posts: &mut [i32; 64], post_count: usize, n: usize, residue: &mut [f32]) {
        if post_count > 0 {
            let step_flags = self.unwrap_posts(posts, post_count);

            let mut lx = 0i32;
            let mut ly = posts[0] * self.multiplier;
            for i in 1..post_count {
                let idx = self.sort_idx[i];

                if step_flags[idx] {
                    let hx = self.x_list[idx];
                    let hy = posts[idx] * self.multiplier;
                    if (lx as usize) < n {
                        render_line_multi(lx, ly, hx.min(n as i32), hy, residue);
                    }
                    lx = hx;
                    ly = hy;
                }
                if lx as usize >= n {
                    break;
                }
            }

            if (lx as usize) < n {
                render_line_multi(lx, ly, n as i32, ly, residue);
            }
        } else {
            residue[..n].fill(0.0);
        }
    }

    fn unwrap_posts(&self, posts: &mut [i32; 64], post_count: usize) -> [bool; 64] {
        let mut step_flags = [false; 64];
        step_flags[0] = true;
        step_flags[1] = true;

        let mut final_y = [0i32; 64];
        final_y[0] = posts[0];
        final_y[1] = posts[1];

        for i in 2..post_count {
            let low_ofs = self.l_neigh[i];
            let high_ofs = self.h_neigh[i];

            let predicted = render_point(
                self.x_list[low_ofs],
                final_y[low_ofs],
                self.x_list[high_ofs],
                final_y[high_ofs],
                self.x_list[i],
            );

            let val = posts[i];
            let highroom = self.range - predicted;
            let lowroom = predicted;
            let room = highroom.min(lowroom) * 2;
            if val != 0 {
                step_flags[low_ofs] = true;
                step_flags[high_ofs] = true;
                step_flags[i] = true;

                if val >= room {
                    if highroom > lowroom {
                        final_y[i] = val - lowroom + predicted;
                    } else {
                        final_y[i] = predicted - val + highroom - 1;
                    }
                } else if val % 2 == 1 {
                    final_y[i] = predicted - (val + 1) / 2;
                } else {
                    final_y[i] = predicted + val / 2;
                }
            } else {
                step_flags[i] = false;
                final_y[i] = predicted;
            }
        }

        posts[..post_count].copy_from_slice(&final_y[..post_count]);

        step_flags
    }
}

fn render_point(x0: i32, y0: i32, x1: i32, y1: i32, x: i32) -> i32 {
    let dy = y1 - y0;
    let adx = x1 - x0;
    let ady = dy.abs();
    let err = ady * (x - x0);
    let off = err / adx;
    if dy < 0 { y0 - off } else { y0 + off }
}

fn render_line_multi(x0: i32, y0: i32, x1: i32, y1: i32, v: &mut [f32]) {
    let dy = y1 - y0;
    let adx = x1 - x0;
    let mut ady = dy.abs();
    let sy = 1 - (((dy >> 31) & 1) * 2);
    let b = dy / adx;
    let mut x = x0;
    let mut y = y0;
    let mut err = -adx;

    v[x0 as usize] *= inverse_db(y0);
    ady -= b.abs() * adx;

    while {
        x += 1;
        x < x1
    } {
        y += b;
        err += ady;
        if err >= 0 {
            err -= adx;
            y += sy;
        }
        v[x as usize] *= inverse_db(y);
    }
}

fn inverse_db(y: i32) -> f32 {
    INVERSE_DB_TABLE[y.clamp(0, 255) as usize]
}

fn to_bark(lsp: f64) -> f32 {
    (13.1 * (0.00074 * lsp).atan() + 2.24 * (0.0000000185 * lsp * lsp).atan() + 0.0001 * lsp) as f32
}

#[rustfmt::skip]
static INVERSE_DB_TABLE: [f32; 256] = [
    1.0649863e-07, 1.1341951e-07, 1.2079015e-07, 1.2863978e-07,
    1.3699951e-07, 1.4590251e-07, 1.5538408e-07, 1.6548181e-07,
    1.7623575e-07, 1.8768855e-07, 1.9988561e-07, 2.1287530e-07,
    2.2670913e-07, 2.4144197e-07, 2.5713223e-07, 2.7384213e-07,
    2.9163793e-07, 3.1059021e-07, 3.3077411e-07, 3.5226968e-07,
    3.7516214e-07, 3.9954229e-07, 4.2550680e-07, 4.5315863e-07,
    4.8260743e-07, 5.1396998e-07, 5.4737065e-07, 5.8294187e-07,
    6.2082472e-07, 6.6116941e-07, 7.0413592e-07, 7.4989464e-07,
    7.9862701e-07, 8.5052630e-07, 9.0579828e-07, 9.6466216e-07,
    1.0273513e-06, 1.0941144e-06, 1.1652161e-06, 1.2409384e-06,
    1.3215816e-06, 1.4074654e-06, 1.4989305e-06, 1.5963394e-06,
    1.7000785e-06, 1.8105592e-06, 1.9282195e-06, 2.0535261e-06,
    2.1869758e-06, 2.3290978e-06, 2.4804557e-06, 2.6416497e-06,
    2.8133190e-06, 2.9961443e-06, 3.1908506e-06, 3.3982101e-06,
    3.6190449e-06, 3.8542308e-06, 4.1047004e-06, 4.3714470e-06,
    4.6555282e-06, 4.9580707e-06, 5.2802740e-06, 5.6234160e-06,
    5.9888572e-06, 6.3780469e-06, 6.7925283e-06, 7.2339451e-06,
    7.7040476e-06, 8.2047000e-06, 8.7378876e-06, 9.3057248e-06,
    9.9104632e-06, 1.0554501e-05, 1.1240392e-05, 1.1970856e-05,
    1.2748789e-05, 1.3577278e-05, 1.4459606e-05, 1.5399272e-05,
    1.6400004e-05, 1.7465768e-05, 1.8600792e-05, 1.9809576e-05,
    2.1096914e-05, 2.2467911e-05, 2.3928002e-05, 2.5482978e-05,
    2.7139006e-05, 2.8902651e-05, 3.0780908e-05, 3.2781225e-05,
    3.4911534e-05, 3.7180282e-05, 3.9596466e-05, 4.2169667e-05,
    4.4910090e-05, 4.7828601e-05, 5.0936773e-05, 5.4246931e-05,
    5.7772202e-05, 6.1526565e-05, 6.5524908e-05, 6.9783085e-05,
    7.4317983e-05, 7.9147585e-05, 8.4291040e-05, 8.9768747e-05,
    9.5602426e-05, 0.00010181521, 0.00010843174, 0.00011547824,
    0.00012298267, 0.00013097477, 0.00013948625, 0.00014855085,
    0.00015820453, 0.00016848555, 0.00017943469, 0.00019109536,
    0.00020351382, 0.00021673929, 0.00023082423, 0.00024582449,
    0.00026179955, 0.00027881276, 0.00029693158, 0.00031622787,
    0.00033677814, 0.00035866388, 0.00038197188, 0.00040679456,
    0.00043323036, 0.00046138411, 0.00049136745, 0.00052329927,
    0.00055730621, 0.00059352311, 0.00063209358, 0.00067317058,
    0.00071691700, 0.00076350630, 0.00081312324, 0.00086596457,
    0.00092223983, 0.00098217216, 0.0010459992,  0.0011139742,
    0.0011863665,  0.0012634633,  0.0013455702,  0.0014330129,
    0.0015261382,  0.0016253153,  0.0017309374,  0.0018434235,
    0.0019632195,  0.0020908006,  0.0022266726,  0.0023713743,
    0.0025254795,  0.0026895994,  0.0028643847,  0.0030505286,
    0.0032487691,  0.0034598925,  0.0036847358,  0.0039241906,
    0.0041792066,  0.0044507950,  0.0047400328,  0.0050480668,
    0.0053761186,  0.0057254891,  0.0060975636,  0.0064938176,
    0.0069158225,  0.0073652516,  0.0078438871,  0.0083536271,
    0.0088964928,  0.009474637,   0.010090352,   0.010746080,
    0.011444421,   0.012188144,   0.012980198,   0.013823725,
    0.014722068,   0.015678791,   0.016697687,   0.017782797,
    0.018938423,   0.020169149,   0.021479854,   0.022875735,
    0.024362330,   0.025945531,   0.027631618,   0.029427276,
    0.031339626,   0.033376252,   0.035545228,   0.037855157,
    0.040315199,   0.042935108,   0.045725273,   0.048696758,
    0.051861348,   0.055231591,   0.058820850,   0.062643361,
    0.066714279,   0.071049749,   0.075666962,   0.080584227,
    0.085821044,   0.091398179,   0.097337747,   0.10366330,
    0.11039993,    0.11757434,    0.12521498,    0.13335215,
    0.14201813,    0.15124727,    0.16107617,    0.17154380,
    0.18269168,    0.19456402,    0.20720788,    0.22067342,
    0.23501402,    0.25028656,    0.26655159,    0.28387361,
    0.30232132,    0.32196786,    0.34289114,    0.36517414,
    0.38890521,    0.41417847,    0.44109412,    0.46975890,
    0.50028648,    0.53279791,    0.56742212,    0.60429640,
    0.64356699,    0.68538959,    0.72993007,    0.77736504,
    0.82788260,    0.88168307,    0.9389798,     1.0,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::packet::{BitWriter, SliceSource};

    // dims 2, entries 4, uniform 2-bit codes, lattice lookup over {1.0, 2.0}
    fn lookup_book() -> Codebook {
        let mut w = BitWriter::new();
        w.write(crate::structs::codebook::CODEBOOK_SYNC as u64, 24);
        w.write(2, 16);
        w.write(4, 24);
        w.write(0, 1);
        w.write(0, 1);
        for _ in 0..4 {
            w.write(1, 5);
        }
        w.write(1, 4);
        w.write(0, 32);
        w.write(1 | (788u64 << 21), 32);
        w.write(1, 4);
        w.write(0, 1);
        w.write(1, 2);
        w.write(2, 2);
        let data = w.finish();
        Codebook::read(&mut BitCursor::new(SliceSource::new(&data))).unwrap()
    }

    fn write_simple_floor1(w: &mut BitWriter) {
        w.write(1, 16); // type 1
        w.write(1, 5); // one partition
        w.write(0, 4); // class 0
        w.write(1, 3); // class 0: 2 dimensions
        w.write(0, 2); // no subclasses
        w.write(0, 8); // subclass book: unused
        w.write(2, 2); // multiplier index 2 -> x3, range 86, 7-bit posts
        w.write(6, 4); // range bits
        w.write(16, 6); // point x = 16
        w.write(32, 6); // point x = 32
    }

    #[test]
    fn floor1_renders_a_line() -> anyhow::Result<()> {
        let mut w = BitWriter::new();
        write_simple_floor1(&mut w);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let floor = Floor::read(&mut reader, 128, 256, &[])
            .map_err(anyhow::Error::from)?;

        let mut data = floor.create_data();

        let mut w = BitWriter::new();
        w.write(1, 1); // nonzero
        w.write(10, 7); // post 0
        w.write(20, 7); // post 1
        let packet = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&packet));
        floor.unpack(&mut reader, 128, &mut data, &[]);
        assert!(data.execute_channel());

        let mut residue = vec![1.0f32; 64];
        floor.apply(&mut data, &mut residue);

        // line from (0, 30) to (64, 60) through the dB table
        assert_eq!(residue[0], INVERSE_DB_TABLE[30]);
        assert_eq!(residue[63], INVERSE_DB_TABLE[59]);
        for pair in residue.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        Ok(())
    }

    #[test]
    fn floor1_zero_bit_means_no_energy() {
        let mut w = BitWriter::new();
        write_simple_floor1(&mut w);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let floor = Floor::read(&mut reader, 128, 256, &[]).unwrap();

        let mut data = floor.create_data();
        let packet = [0u8];
        let mut reader = BitCursor::new(SliceSource::new(&packet));
        floor.unpack(&mut reader, 128, &mut data, &[]);
        assert!(!data.execute_channel());

        let mut residue = vec![1.0f32; 64];
        floor.apply(&mut data, &mut residue);
        assert!(residue.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn floor1_rejects_duplicate_points() {
        let mut w = BitWriter::new();
        w.write(1, 16);
        w.write(1, 5);
        w.write(0, 4);
        w.write(1, 3);
        w.write(0, 2);
        w.write(0, 8);
        w.write(0, 2);
        w.write(6, 4);
        w.write(16, 6);
        w.write(16, 6); // duplicate x
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Floor::read(&mut reader, 128, 256, &[]),
            Err(FloorError::DuplicatePoint(16))
        ));
    }

    #[test]
    fn floor0_parses_and_clears_on_zero_amplitude() {
        let books = vec![lookup_book()];

        let mut w = BitWriter::new();
        w.write(0, 16); // type 0
        w.write(4, 8); // order
        w.write(8000, 16); // rate
        w.write(16, 16); // bark map size
        w.write(6, 6); // amplitude bits
        w.write(100, 8); // amplitude offset
        w.write(0, 4); // one book
        w.write(0, 8); // book 0
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let floor = Floor::read(&mut reader, 128, 256, &books).unwrap();
        let mut data = floor.create_data();

        // zero amplitude silences the channel
        let packet = [0u8];
        let mut reader = BitCursor::new(SliceSource::new(&packet));
        floor.unpack(&mut reader, 128, &mut data, &books);
        assert!(!data.execute_channel());

        let mut residue = vec![1.0f32; 64];
        floor.apply(&mut data, &mut residue);
        assert!(residue.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn floor0_synthesizes_finite_envelope() {
        let books = vec![lookup_book()];

        let mut w = BitWriter::new();
        w.write(0, 16);
        w.write(4, 8);
        w.write(8000, 16);
        w.write(16, 16);
        w.write(6, 6);
        w.write(100, 8);
        w.write(0, 4);
        w.write(0, 8);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let floor = Floor::read(&mut reader, 128, 256, &books).unwrap();
        let mut data = floor.create_data();

        let mut w = BitWriter::new();
        w.write(32, 6); // amplitude
        w.write(0, 1); // book 0 of 1
        w.write(0b00, 2); // entry 0
        w.write(0b10, 2); // entry 1
        let packet = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&packet));
        floor.unpack(&mut reader, 128, &mut data, &books);
        assert!(data.execute_channel());

        let mut residue = vec![1.0f32; 64];
        floor.apply(&mut data, &mut residue);
        assert!(residue.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn unknown_floor_type_is_rejected() {
        let mut w = BitWriter::new();
        w.write(2, 16);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Floor::read(&mut reader, 128, 256, &[]),
            Err(FloorError::UnsupportedType(2))
        ));
    }
}
