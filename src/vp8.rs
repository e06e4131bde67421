//! Decoding of VP8 keyframe bitstreams (RFC 6386).
//!
//! The pipeline per macroblock: mode parsing from the first partition,
//! DCT token decoding from the per-row token partitions, dequantization,
//! inverse transforms, intra prediction, and the in-loop deblocking filter
//! once the whole frame is reconstructed. Output is YUV 4:2:0; RGB(A)
//! emission converts with BT.601 limited-range integer math and
//! nearest-neighbor chroma upsampling.

use byteorder::{LittleEndian, ReadBytesExt};
use num_traits::clamp;
use std::io::Read;

use crate::decoder::DecodingError;
use crate::loop_filter;
use crate::transform;
use crate::vp8_arithmetic_decoder::BoolReader;

type Prob = u8;

const MAX_SEGMENTS: usize = 4;
const NUM_DCT_TOKENS: usize = 12;

// Zig-zag scan order of the 4x4 coefficients.
const ZIGZAG: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

// Probability band per zig-zag position.
const COEFF_BANDS: [u8; 16] = [0, 1, 2, 3, 6, 4, 5, 6, 6, 6, 6, 6, 6, 6, 6, 7];

#[rustfmt::skip]
const DC_QUANT: [i16; 128] = [
      4,   5,   6,   7,   8,   9,  10,  10,  11,  12,  13,  14,  15,  16,  17,  17,
     18,  19,  20,  20,  21,  21,  22,  22,  23,  23,  24,  25,  25,  26,  27,  28,
     29,  30,  31,  32,  33,  34,  35,  36,  37,  37,  38,  39,  40,  41,  42,  43,
     44,  45,  46,  46,  47,  48,  49,  50,  51,  52,  53,  54,  55,  56,  57,  58,
     59,  60,  61,  62,  63,  64,  65,  66,  67,  68,  69,  70,  71,  72,  73,  74,
     75,  76,  76,  77,  78,  79,  80,  81,  82,  83,  84,  85,  86,  87,  88,  89,
     91,  93,  95,  96,  98, 100, 101, 102, 104, 106, 108, 110, 112, 114, 116, 118,
    122, 124, 126, 128, 130, 132, 134, 136, 138, 140, 143, 145, 148, 151, 154, 157,
];

#[rustfmt::skip]
const AC_QUANT: [i16; 128] = [
      4,   5,   6,   7,   8,   9,  10,  11,  12,  13,  14,  15,  16,  17,  18,  19,
     20,  21,  22,  23,  24,  25,  26,  27,  28,  29,  30,  31,  32,  33,  34,  35,
     36,  37,  38,  39,  40,  41,  42,  43,  44,  45,  46,  47,  48,  49,  50,  51,
     52,  53,  54,  55,  56,  57,  58,  60,  62,  64,  66,  68,  70,  72,  74,  76,
     78,  80,  82,  84,  86,  88,  90,  92,  94,  96,  98, 100, 102, 104, 106, 108,
    110, 112, 114, 116, 119, 122, 125, 128, 131, 134, 137, 140, 143, 146, 149, 152,
    155, 158, 161, 164, 167, 170, 173, 177, 181, 185, 189, 193, 197, 201, 205, 209,
    213, 217, 221, 225, 229, 234, 239, 245, 249, 254, 259, 264, 269, 274, 279, 284,
];

// DCT token values. The categories carry extra bits on top of a base.
const DCT_0: i8 = 0;
const DCT_EOB: i8 = 11;

#[rustfmt::skip]
const COEFF_TOKEN_TREE: [i8; 2 * (NUM_DCT_TOKENS - 1)] = [
    -DCT_EOB, 2,
     -DCT_0, 4,
      -1, 6,
       8, 12,
        -2, 10,
         -3, -4,
        14, 16,
         -5, -6,
        18, 20,
         -7, -8,
         -9, -10,
];

// (base value, extra-bit probabilities) for tokens cat1..cat6.
const DCT_CATEGORIES: [(i32, &[Prob]); 6] = [
    (5, &[159]),
    (7, &[165, 145]),
    (11, &[173, 148, 140]),
    (19, &[176, 155, 140, 135]),
    (35, &[180, 157, 141, 134, 130]),
    (67, &[254, 254, 243, 230, 196, 177, 153, 140, 133, 130, 129]),
];

const SEGMENT_ID_TREE: [i8; 6] = [2, 4, 0, -1, -2, -3];

// Keyframe luma mode coding: B_PRED first, then the 16x16 modes.
const KEYFRAME_YMODE_TREE: [i8; 8] = [-4, 2, 4, 6, 0, -1, -2, -3];
const KEYFRAME_YMODE_PROBS: [Prob; 4] = [145, 156, 163, 128];

const CHROMA_MODE_TREE: [i8; 6] = [0, 2, -1, 4, -2, -3];
const KEYFRAME_CHROMA_MODE_PROBS: [Prob; 3] = [142, 114, 183];

#[rustfmt::skip]
const INTRA_MODE_TREE: [i8; 18] = [
    0, 2,
     -1, 4,
      -2, 6,
       8, 12,
        -3, 10,
         -5, -6,
        -4, 14,
         -7, 16,
          -8, -9,
];

// kf_bmode_prob[above][left]: context-conditioned probabilities for the
// intra 4x4 subblock mode tree.
#[rustfmt::skip]
const KEYFRAME_BPRED_PROBS: [[[Prob; 9]; 10]; 10] = [
    [
        [231, 120,  48,  89, 115, 113, 120, 152, 112],
        [152, 179,  64, 126, 170, 118,  46,  70,  95],
        [175,  69, 143,  80,  85,  82,  72, 155, 103],
        [ 56,  58,  10, 171, 218, 189,  17,  13, 152],
        [144,  71,  10,  38, 171, 213, 144,  34,  26],
        [114,  26,  17, 163,  44, 195,  21,  10, 173],
        [121,  24,  80, 195,  26,  62,  44,  64,  85],
        [170,  46,  55,  19, 136, 160,  33, 206,  71],
        [ 63,  20,   8, 114, 114, 208,  12,   9, 226],
        [ 81,  40,  11,  96, 182,  84,  29,  16,  36],
    ],
    [
        [134, 183,  89, 137,  98, 101, 106, 165, 148],
        [ 72, 187, 100, 130, 157, 111,  32,  75,  80],
        [ 66, 102, 167,  99,  74,  62,  40, 234, 128],
        [ 41,  53,   9, 178, 241, 141,  26,   8, 107],
        [104,  79,  12,  27, 217, 255,  87,  17,   7],
        [ 74,  43,  26, 146,  73, 166,  49,  23, 157],
        [ 65,  38, 105, 160,  51,  52,  31, 115, 128],
        [ 87,  68,  71,  44, 114,  51,  15, 186,  23],
        [ 47,  41,  14, 110, 182, 183,  21,  17, 194],
        [ 66,  45,  25, 102, 197, 189,  23,  18,  22],
    ],
    [
        [ 88,  88, 147, 150,  42,  46,  45, 196, 205],
        [ 43,  97, 183, 117,  85,  38,  35, 179,  61],
        [ 39,  53, 200,  87,  26,  21,  43, 232, 171],
        [ 56,  34,  51, 104, 114, 102,  29,  93,  77],
        [107,  54,  32,  26,  51,   1,  81,  43,  31],
        [ 39,  28,  85, 171,  58, 165,  90,  98,  64],
        [ 34,  22, 116, 206,  23,  34,  43, 166,  73],
        [ 68,  25, 106,  22,  64, 171,  36, 225, 114],
        [ 34,  19,  21, 102, 132, 188,  16,  76, 124],
        [ 62,  18,  78,  95,  85,  57,  50,  48,  51],
    ],
    [
        [193, 101,  35, 159, 215, 111,  89,  46, 111],
        [ 60, 148,  31, 172, 219, 228,  21,  18, 111],
        [112, 113,  77,  85, 179, 255,  38, 120, 114],
        [ 40,  42,   1, 196, 245, 209,  10,  25, 109],
        [100,  80,   8,  43, 154,   1,  51,  26,  71],
        [ 88,  43,  29, 140, 166, 213,  37,  43, 154],
        [ 61,  63,  30, 155,  67,  45,  68,   1, 209],
        [142,  78,  78,  16, 255, 128,  34, 197, 171],
        [ 41,  40,   5, 102, 211, 183,   4,   1, 221],
        [ 51,  50,  17, 168, 209, 192,  23,  25,  82],
    ],
    [
        [125,  98,  42,  88, 104,  85, 117, 175,  82],
        [ 95,  84,  53,  89, 128, 100, 113, 101,  45],
        [ 75,  79, 123,  47,  51, 128,  81, 171,   1],
        [ 57,  17,   5,  71, 102,  57,  53,  41,  49],
        [115,  21,   2,  10, 102, 255, 166,  23,   6],
        [ 38,  33,  13, 121,  57,  73,  26,   1,  85],
        [ 41,  10,  67, 138,  77, 110,  90,  47, 114],
        [101,  29,  16,  10,  85, 128, 101, 196,  26],
        [ 57,  18,  10, 102, 102, 213,  34,  20,  43],
        [117,  20,  15,  36, 163, 128,  68,   1,  26],
    ],
    [
        [138,  31,  36, 171,  27, 166,  38,  44, 229],
        [ 67,  87,  58, 169,  82, 115,  26,  59, 179],
        [ 63,  59,  90, 180,  59, 166,  93,  73, 154],
        [ 40,  40,  21, 116, 143, 209,  34,  39, 175],
        [ 57,  46,  22,  24, 128,   1,  54,  17,  37],
        [ 69,  40,  17, 158,  25, 220,  49,  25, 194],
        [ 23,  14,  44, 125,  34, 187,  61,  16, 110],
        [104,  55,  44, 218,   9,  54,  53, 130, 226],
        [ 60,  47,  16,  91,  64, 222,  17,  49, 204],
        [ 59, 148,  35,  64,  34,  77, 128,  87, 197],
    ],
    [
        [125,  34, 187,  52,  41, 105,  37, 146, 166],
        [ 98,  35, 127,  87,  43,  45,  42, 186,  87],
        [ 84,  10, 197,  52,  12, 102,  40, 241, 166],
        [ 75,  32,  12,  51, 192, 255, 160,  43,  51],
        [ 95,  56,  19,  32,  27, 128, 166,  63,  69],
        [ 66,  88,  21,  53, 102, 137,  77, 110,  92],
        [ 54,  18,  97, 146,  35,  62,  44,  73,  88],
        [ 97,  48,  39,  57, 118, 112,  21, 218, 105],
        [ 46,  22,  24,  89, 121, 205,  19,  27, 120],
        [ 37,  43,  37, 154, 100, 163,  85, 160,   1],
    ],
    [
        [164,  50,  31, 137, 154, 133,  25,  35, 218],
        [ 51, 103,  44, 131, 131, 123,  31,   6, 158],
        [ 86,  40,  64, 135, 148, 224,  45, 183, 128],
        [ 22,  26,  17, 131, 240, 154,  14,   1, 209],
        [ 83,  12,  13,  54, 192, 255,  68,  47,  28],
        [ 45,  16,  21,  91,  64, 222,   7,   1, 197],
        [ 56,  21,  23, 111,  59, 205,  45,  37, 192],
        [ 85,  26,  85,  85, 128, 128,  32, 146, 171],
        [ 18,  11,   7,  63, 144, 171,   4,   4, 246],
        [ 35,  27,  10, 146, 174, 171,  12,  26, 128],
    ],
    [
        [190,  80,  35,  99, 180,  80, 126,  54,  45],
        [ 85, 126,  47,  87, 176,  51,  41,  20,  32],
        [101,  75, 128, 139, 118, 146, 116, 128,  85],
        [ 56,  41,  15, 176, 236,  85,  37,   9,  62],
        [146,  36,  19,  30, 171, 255,  97,  27,  20],
        [ 71,  80,  25,  14,  61, 255, 128, 128, 128],
        [101,  21, 107, 181, 192, 103,  19,  67, 125],
        [ 75,  54,  49,  33, 128, 128,  80, 141,  97],
        [ 31,   9,  11, 128, 116, 128,  76,  17, 223],
        [ 55,  38,  70, 124,  73, 102,   1,  34,  98],
    ],
    [
        [102,  61,  71,  37,  34,  53,  31, 243, 192],
        [ 69,  60,  71,  38,  73, 119,  28, 222,  37],
        [ 68,  45, 128,  34,   1,  47,  11, 245, 147],
        [ 62,  17,  19,  70, 146,  85,  55,  62,  70],
        [ 75,  15,   9,   9,  64, 255, 184, 119,  16],
        [ 37,  43,  37, 154, 100, 163,  85, 160,   1],
        [ 63,   9,  92, 136,  28,  64,  32, 201,  85],
        [ 86,   6,  28,   5,  64, 255,  25, 248,   1],
        [ 56,   8,  17, 132, 137, 255,  55, 116, 128],
        [ 58,  15,  20,  82, 135,  57,  26, 121,  40],
    ],
];

// Default token probabilities, [block type][band][context][node].
#[rustfmt::skip]
const COEFF_PROBS: TokenProbs = [
    [
        [
            [128, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
            [128, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
            [128, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
        [
            [253, 136, 254, 255, 228, 219, 128, 128, 128, 128, 128],
            [189, 129, 242, 255, 227, 213, 255, 219, 128, 128, 128],
            [106, 126, 227, 252, 214, 209, 255, 255, 128, 128, 128],
        ],
        [
            [  1,  98, 248, 255, 236, 226, 255, 255, 128, 128, 128],
            [181, 133, 238, 254, 221, 234, 255, 154, 128, 128, 128],
            [ 78, 134, 202, 247, 198, 180, 255, 219, 128, 128, 128],
        ],
        [
            [  1, 185, 249, 255, 243, 255, 128, 128, 128, 128, 128],
            [184, 150, 247, 255, 236, 224, 128, 128, 128, 128, 128],
            [ 77, 110, 216, 255, 236, 230, 128, 128, 128, 128, 128],
        ],
        [
            [  1, 101, 251, 255, 241, 255, 128, 128, 128, 128, 128],
            [170, 139, 241, 252, 236, 209, 255, 255, 128, 128, 128],
            [ 37, 116, 196, 243, 228, 255, 255, 255, 128, 128, 128],
        ],
        [
            [  1, 204, 254, 255, 245, 255, 128, 128, 128, 128, 128],
            [207, 160, 250, 255, 238, 128, 128, 128, 128, 128, 128],
            [102, 103, 225, 255, 210, 240, 128, 128, 128, 128, 128],
        ],
        [
            [  1, 152, 252, 255, 240, 255, 128, 128, 128, 128, 128],
            [177, 135, 243, 255, 234, 225, 128, 128, 128, 128, 128],
            [ 80, 129, 211, 255, 194, 224, 128, 128, 128, 128, 128],
        ],
        [
            [  1,   1, 128, 128, 128, 128, 128, 128, 128, 128, 128],
            [246,   1, 255, 128, 128, 128, 128, 128, 128, 128, 128],
            [255, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
    ],
    [
        [
            [198,  35, 237, 223, 193, 187, 162, 160, 145, 155,  62],
            [131,  45, 198, 221, 172, 176, 220, 157, 252, 221,   1],
            [ 68,  47, 146, 208, 149, 167, 221, 162, 255, 223, 128],
        ],
        [
            [  1, 149, 241, 255, 221, 224, 255, 255, 128, 128, 128],
            [184, 141, 234, 253, 222, 220, 255, 199, 128, 128, 128],
            [ 81,  99, 181, 242, 176, 190, 249, 202, 255, 255, 128],
        ],
        [
            [  1, 129, 232, 253, 214, 197, 242, 196, 255, 255, 128],
            [ 99, 121, 210, 250, 201, 198, 255, 202, 128, 128, 128],
            [ 23,  91, 163, 242, 170, 187, 247, 210, 255, 255, 128],
        ],
        [
            [  1, 200, 246, 255, 234, 255, 128, 128, 128, 128, 128],
            [109, 178, 241, 255, 231, 245, 255, 255, 128, 128, 128],
            [ 44, 130, 201, 253, 205, 192, 255, 255, 128, 128, 128],
        ],
        [
            [  1, 132, 239, 251, 219, 209, 255, 165, 128, 128, 128],
            [ 94, 136, 225, 251, 218, 190, 255, 255, 128, 128, 128],
            [ 22, 100, 174, 245, 186, 161, 255, 199, 128, 128, 128],
        ],
        [
            [  1, 182, 249, 255, 232, 235, 128, 128, 128, 128, 128],
            [124, 143, 241, 255, 227, 234, 128, 128, 128, 128, 128],
            [ 35,  77, 181, 251, 193, 211, 255, 205, 128, 128, 128],
        ],
        [
            [  1, 157, 247, 255, 236, 231, 255, 255, 128, 128, 128],
            [121, 141, 235, 255, 225, 227, 255, 255, 128, 128, 128],
            [ 45,  99, 188, 251, 195, 217, 255, 224, 128, 128, 128],
        ],
        [
            [  1,   1, 251, 255, 213, 255, 128, 128, 128, 128, 128],
            [203,   1, 248, 255, 255, 128, 128, 128, 128, 128, 128],
            [137,   1, 177, 255, 224, 255, 128, 128, 128, 128, 128],
        ],
    ],
    [
        [
            [253,   9, 248, 251, 207, 208, 255, 192, 128, 128, 128],
            [175,  13, 224, 243, 193, 185, 249, 198, 255, 255, 128],
            [ 73,  17, 171, 221, 161, 179, 236, 167, 255, 234, 128],
        ],
        [
            [  1,  95, 247, 253, 212, 183, 255, 255, 128, 128, 128],
            [239,  90, 244, 250, 211, 209, 255, 255, 128, 128, 128],
            [155,  77, 195, 248, 188, 195, 255, 255, 128, 128, 128],
        ],
        [
            [  1,  24, 239, 251, 218, 219, 255, 205, 128, 128, 128],
            [201,  51, 219, 255, 196, 186, 128, 128, 128, 128, 128],
            [ 69,  46, 190, 239, 201, 218, 255, 228, 128, 128, 128],
        ],
        [
            [  1, 191, 251, 255, 255, 128, 128, 128, 128, 128, 128],
            [223, 165, 249, 255, 213, 255, 128, 128, 128, 128, 128],
            [141, 124, 248, 255, 255, 128, 128, 128, 128, 128, 128],
        ],
        [
            [  1,  16, 248, 255, 255, 128, 128, 128, 128, 128, 128],
            [190,  36, 230, 255, 236, 255, 128, 128, 128, 128, 128],
            [149,   1, 255, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
        [
            [  1, 226, 255, 128, 128, 128, 128, 128, 128, 128, 128],
            [247, 192, 255, 128, 128, 128, 128, 128, 128, 128, 128],
            [240, 128, 255, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
        [
            [  1, 134, 252, 255, 255, 128, 128, 128, 128, 128, 128],
            [213,  62, 250, 255, 255, 128, 128, 128, 128, 128, 128],
            [ 55,  93, 255, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
        [
            [128, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
            [128, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
            [128, 128, 128, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
    ],
    [
        [
            [202,  24, 213, 235, 186, 191, 220, 160, 240, 175, 255],
            [126,  38, 166, 203, 143, 168, 237, 175, 255, 255, 128],
            [ 61,  46, 138, 188, 134, 130, 210, 158, 255, 255, 128],
        ],
        [
            [  1, 112, 230, 250, 199, 191, 247, 159, 255, 255, 128],
            [166, 109, 228, 252, 211, 215, 255, 223, 128, 128, 128],
            [ 39,  77, 162, 232, 172, 180, 245, 178, 255, 255, 128],
        ],
        [
            [  1,  52, 220, 246, 198, 199, 249, 220, 255, 255, 128],
            [124,  74, 191, 243, 183, 193, 250, 221, 255, 255, 128],
            [ 24,  71, 130, 219, 154, 170, 243, 182, 255, 255, 128],
        ],
        [
            [  1, 182, 225, 249, 219, 240, 255, 224, 128, 128, 128],
            [149, 150, 226, 252, 216, 205, 255, 171, 128, 128, 128],
            [ 28, 108, 170, 242, 183, 194, 254, 223, 255, 255, 128],
        ],
        [
            [  1,  81, 230, 252, 204, 203, 255, 192, 128, 128, 128],
            [123, 102, 209, 247, 188, 196, 255, 233, 128, 128, 128],
            [ 20,  95, 153, 243, 164, 173, 255, 203, 128, 128, 128],
        ],
        [
            [  1, 222, 248, 255, 216, 213, 128, 128, 128, 128, 128],
            [168, 175, 246, 252, 235, 205, 255, 255, 128, 128, 128],
            [ 47, 116, 215, 255, 211, 212, 255, 255, 128, 128, 128],
        ],
        [
            [  1, 121, 236, 253, 212, 214, 255, 255, 128, 128, 128],
            [141,  84, 213, 252, 201, 202, 255, 219, 128, 128, 128],
            [ 42,  80, 160, 240, 162, 185, 255, 205, 128, 128, 128],
        ],
        [
            [  1,   1, 255, 128, 128, 128, 128, 128, 128, 128, 128],
            [244,   1, 255, 128, 128, 128, 128, 128, 128, 128, 128],
            [238,   1, 255, 128, 128, 128, 128, 128, 128, 128, 128],
        ],
    ],
];

// Probabilities that each token probability is updated in the header,
// same shape as the token probabilities themselves.
#[rustfmt::skip]
const COEFF_UPDATE_PROBS: TokenProbs = [
    [
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [176, 246, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [223, 241, 252, 255, 255, 255, 255, 255, 255, 255, 255],
            [249, 253, 253, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 244, 252, 255, 255, 255, 255, 255, 255, 255, 255],
            [234, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [253, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 246, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [239, 253, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 248, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [251, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 253, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [251, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 254, 253, 255, 254, 255, 255, 255, 255, 255, 255],
            [250, 255, 254, 255, 254, 255, 255, 255, 255, 255, 255],
            [254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
    ],
    [
        [
            [217, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [225, 252, 241, 253, 255, 255, 254, 255, 255, 255, 255],
            [234, 250, 241, 250, 253, 255, 253, 254, 255, 255, 255],
        ],
        [
            [255, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [223, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [238, 253, 254, 254, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 248, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [249, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 253, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [247, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 253, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [252, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [253, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 254, 253, 255, 255, 255, 255, 255, 255, 255, 255],
            [250, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
    ],
    [
        [
            [186, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [234, 251, 244, 254, 255, 255, 255, 255, 255, 255, 255],
            [251, 251, 243, 253, 254, 255, 254, 255, 255, 255, 255],
        ],
        [
            [255, 253, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [236, 253, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [251, 253, 253, 254, 254, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
    ],
    [
        [
            [248, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [250, 254, 252, 254, 255, 255, 255, 255, 255, 255, 255],
            [248, 254, 249, 253, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 253, 253, 255, 255, 255, 255, 255, 255, 255, 255],
            [246, 253, 253, 255, 255, 255, 255, 255, 255, 255, 255],
            [252, 254, 251, 254, 254, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 254, 252, 255, 255, 255, 255, 255, 255, 255, 255],
            [248, 254, 253, 255, 255, 255, 255, 255, 255, 255, 255],
            [253, 255, 254, 254, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 251, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [245, 251, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [253, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 251, 253, 255, 255, 255, 255, 255, 255, 255, 255],
            [252, 253, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 252, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [249, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 254, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 253, 255, 255, 255, 255, 255, 255, 255, 255],
            [250, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
        [
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
            [255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255],
        ],
    ],
];

type TokenProbs = [[[[Prob; 11]; 3]; 8]; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LumaMode {
    #[default]
    DC = 0,
    V = 1,
    H = 2,
    TM = 3,
    B = 4,
}

impl LumaMode {
    fn from_i8(value: i8) -> Option<Self> {
        Some(match value {
            0 => Self::DC,
            1 => Self::V,
            2 => Self::H,
            3 => Self::TM,
            4 => Self::B,
            _ => return None,
        })
    }

    /// The subblock mode a whole-macroblock mode implies for neighboring
    /// intra 4x4 context.
    fn into_intra(self) -> Option<IntraMode> {
        Some(match self {
            Self::DC => IntraMode::DC,
            Self::V => IntraMode::VE,
            Self::H => IntraMode::HE,
            Self::TM => IntraMode::TM,
            Self::B => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChromaMode {
    #[default]
    DC = 0,
    V = 1,
    H = 2,
    TM = 3,
}

impl ChromaMode {
    fn from_i8(value: i8) -> Option<Self> {
        Some(match value {
            0 => Self::DC,
            1 => Self::V,
            2 => Self::H,
            3 => Self::TM,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IntraMode {
    #[default]
    DC = 0,
    TM = 1,
    VE = 2,
    HE = 3,
    LD = 4,
    RD = 5,
    VR = 6,
    VL = 7,
    HD = 8,
    HU = 9,
}

impl IntraMode {
    fn from_i8(value: i8) -> Option<Self> {
        Some(match value {
            0 => Self::DC,
            1 => Self::TM,
            2 => Self::VE,
            3 => Self::HE,
            4 => Self::LD,
            5 => Self::RD,
            6 => Self::VR,
            7 => Self::VL,
            8 => Self::HD,
            9 => Self::HU,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Default)]
struct Segment {
    // raw header values
    quantizer_level: i8,
    loopfilter_level: i8,

    // resolved dequantization factors
    ydc: i16,
    yac: i16,
    y2dc: i16,
    y2ac: i16,
    uvdc: i16,
    uvac: i16,
}

#[derive(Clone, Copy, Default)]
struct MacroBlock {
    bpred: [IntraMode; 16],
    luma_mode: LumaMode,
    chroma_mode: ChromaMode,
    segment_id: u8,
    coeffs_skipped: bool,
    non_zero_dct: bool,
}

/// Nonzero-coefficient flags feeding the token-probability context.
#[derive(Clone, Copy, Default)]
struct NonZeroContext {
    y: [bool; 4],
    u: [bool; 2],
    v: [bool; 2],
    y2: bool,
}

/// A decoded YUV 4:2:0 keyframe. Planes are macroblock-aligned; `width`
/// and `height` are the display dimensions the RGB emission crops to.
#[derive(Clone, Default)]
pub(crate) struct Frame {
    pub(crate) width: u16,
    pub(crate) height: u16,
    ybuf: Vec<u8>,
    ubuf: Vec<u8>,
    vbuf: Vec<u8>,
    ystride: usize,
    uvstride: usize,
}

impl Frame {
    fn rgb_at(&self, x: usize, y: usize) -> (u8, u8, u8) {
        let luma = i32::from(self.ybuf[y * self.ystride + x]);
        let u = i32::from(self.ubuf[(y / 2) * self.uvstride + x / 2]);
        let v = i32::from(self.vbuf[(y / 2) * self.uvstride + x / 2]);

        // BT.601 limited range, fixed point with one rounding term.
        let c = 298 * (luma - 16);
        let r = clamp((c + 409 * (v - 128) + 128) >> 8, 0, 255);
        let g = clamp((c - 100 * (u - 128) - 208 * (v - 128) + 128) >> 8, 0, 255);
        let b = clamp((c + 516 * (u - 128) + 128) >> 8, 0, 255);
        (r as u8, g as u8, b as u8)
    }

    /// Writes the frame as interleaved RGB bytes.
    pub(crate) fn fill_rgb(&self, buf: &mut [u8]) {
        self.fill(buf, 3);
    }

    /// Writes the frame as interleaved RGBA bytes with opaque alpha.
    pub(crate) fn fill_rgba(&self, buf: &mut [u8]) {
        self.fill(buf, 4);
    }

    fn fill(&self, buf: &mut [u8], bytes_per_pixel: usize) {
        for y in 0..usize::from(self.height) {
            for x in 0..usize::from(self.width) {
                let (r, g, b) = self.rgb_at(x, y);
                let index = (y * usize::from(self.width) + x) * bytes_per_pixel;
                buf[index] = r;
                buf[index + 1] = g;
                buf[index + 2] = b;
                if bytes_per_pixel == 4 {
                    buf[index + 3] = 255;
                }
            }
        }
    }
}

/// Decoder for VP8 chunk payloads. Only keyframes are valid in WebP.
pub(crate) struct Vp8Decoder<R> {
    r: R,
    b: BoolReader,
    partitions: Vec<BoolReader>,

    frame: Frame,
    mbwidth: u16,
    mbheight: u16,

    segments_enabled: bool,
    segments_update_map: bool,
    segment_feature_absolute: bool,
    segment_tree_probs: [Prob; 3],
    segments: [Segment; MAX_SEGMENTS],

    simple_filter: bool,
    filter_level: u8,
    sharpness: u8,
    filter_deltas_enabled: bool,
    ref_filter_deltas: [i8; 4],
    mode_filter_deltas: [i8; 4],

    token_probs: Box<TokenProbs>,
    prob_skip_false: Option<Prob>,

    top: Vec<MacroBlock>,
    left: MacroBlock,
    top_ctx: Vec<NonZeroContext>,
    left_ctx: NonZeroContext,

    macroblocks: Vec<MacroBlock>,
}

impl<R: Read> Vp8Decoder<R> {
    pub(crate) fn new(r: R) -> Vp8Decoder<R> {
        Vp8Decoder {
            r,
            b: BoolReader::new(),
            partitions: Vec::new(),
            frame: Frame::default(),
            mbwidth: 0,
            mbheight: 0,
            segments_enabled: false,
            segments_update_map: false,
            segment_feature_absolute: false,
            segment_tree_probs: [255; 3],
            segments: [Segment::default(); MAX_SEGMENTS],
            simple_filter: false,
            filter_level: 0,
            sharpness: 0,
            filter_deltas_enabled: false,
            ref_filter_deltas: [0; 4],
            mode_filter_deltas: [0; 4],
            token_probs: Box::new(COEFF_PROBS),
            prob_skip_false: None,
            top: Vec::new(),
            left: MacroBlock::default(),
            top_ctx: Vec::new(),
            left_ctx: NonZeroContext::default(),
            macroblocks: Vec::new(),
        }
    }

    /// Decodes the whole frame: header, every macroblock, then the in-loop
    /// filter.
    pub(crate) fn decode_frame(&mut self) -> Result<&Frame, DecodingError> {
        self.read_frame_header()?;

        for mby in 0..usize::from(self.mbheight) {
            self.left = MacroBlock::default();
            self.left_ctx = NonZeroContext::default();

            for mbx in 0..usize::from(self.mbwidth) {
                let mut mb = self.read_macroblock_header(mbx)?;

                let blocks = if mb.coeffs_skipped {
                    self.clear_context_for_skipped(&mb, mbx);
                    [0i16; 384]
                } else {
                    self.read_residual_data(&mut mb, mbx, mby)
                };

                self.reconstruct_macroblock(&mb, mbx, mby, &blocks);

                self.top[mbx] = mb;
                self.left = mb;
                self.macroblocks.push(mb);
            }
        }

        if self.partitions.iter().any(BoolReader::is_exhausted) {
            // Graceful under-run: affected blocks already decoded as zero.
            log::debug!("token partition ran out of data before the last macroblock");
        }

        self.filter_frame();

        Ok(&self.frame)
    }

    fn read_frame_header(&mut self) -> Result<(), DecodingError> {
        let tag = self.r.read_u24::<LittleEndian>()?;

        let keyframe = tag & 1 == 0;
        if !keyframe {
            return Err(DecodingError::UnsupportedFeature(
                "Non-keyframe frames".to_owned(),
            ));
        }
        let version = (tag >> 1) & 7;
        if version > 3 {
            return Err(DecodingError::UnsupportedFeature(format!(
                "VP8 version {version}"
            )));
        }
        let first_partition_size = tag >> 5;

        let mut magic = [0u8; 3];
        self.r.read_exact(&mut magic)?;
        if magic != [0x9d, 0x01, 0x2a] {
            return Err(DecodingError::Vp8MagicInvalid(magic));
        }

        let w = self.r.read_u16::<LittleEndian>()?;
        let h = self.r.read_u16::<LittleEndian>()?;
        let width = w & 0x3fff;
        let height = h & 0x3fff;
        if width == 0 || height == 0 {
            return Err(DecodingError::InfoBitsInvalid {
                name: "frame dimensions",
                value: u32::from(w) << 16 | u32::from(h),
            });
        }
        log::debug!(
            "vp8 keyframe {width}x{height}, version {version}, first partition {first_partition_size}B"
        );

        self.mbwidth = (width + 15) / 16;
        self.mbheight = (height + 15) / 16;

        self.frame.width = width;
        self.frame.height = height;
        self.frame.ystride = usize::from(self.mbwidth) * 16;
        self.frame.uvstride = usize::from(self.mbwidth) * 8;
        self.frame.ybuf = vec![0; self.frame.ystride * usize::from(self.mbheight) * 16];
        self.frame.ubuf = vec![0; self.frame.uvstride * usize::from(self.mbheight) * 8];
        self.frame.vbuf = vec![0; self.frame.uvstride * usize::from(self.mbheight) * 8];

        self.top = vec![MacroBlock::default(); usize::from(self.mbwidth)];
        self.top_ctx = vec![NonZeroContext::default(); usize::from(self.mbwidth)];
        self.macroblocks =
            Vec::with_capacity(usize::from(self.mbwidth) * usize::from(self.mbheight));

        let mut first_partition = vec![0u8; first_partition_size as usize];
        self.r
            .read_exact(&mut first_partition)
            .map_err(|_| DecodingError::NotEnoughInitData)?;
        self.b.init(first_partition);

        let color_space = self.b.read_literal(1);
        if color_space != 0 {
            return Err(DecodingError::ColorSpaceInvalid(color_space));
        }
        let _clamping = self.b.read_flag();

        self.read_segment_updates();
        self.read_loop_filter_adjustments();
        self.read_partitions()?;
        self.read_quantization_indices();

        // Keyframes still carry the refresh flag; the probabilities are
        // rebuilt per image either way.
        let _refresh_entropy_probs = self.b.read_flag();

        self.read_token_prob_updates();

        self.prob_skip_false = if self.b.read_flag() {
            Some(self.b.read_literal(8))
        } else {
            None
        };

        Ok(())
    }

    fn read_segment_updates(&mut self) {
        self.segments_enabled = self.b.read_flag();
        if !self.segments_enabled {
            return;
        }

        self.segments_update_map = self.b.read_flag();
        let update_data = self.b.read_flag();

        if update_data {
            self.segment_feature_absolute = self.b.read_flag();
            for segment in self.segments.iter_mut() {
                segment.quantizer_level = self.b.read_optional_signed_value(7) as i8;
            }
            for segment in self.segments.iter_mut() {
                segment.loopfilter_level = self.b.read_optional_signed_value(6) as i8;
            }
        }

        if self.segments_update_map {
            for prob in self.segment_tree_probs.iter_mut() {
                *prob = if self.b.read_flag() {
                    self.b.read_literal(8)
                } else {
                    255
                };
            }
        }
    }

    fn read_loop_filter_adjustments(&mut self) {
        self.simple_filter = self.b.read_flag();
        self.filter_level = self.b.read_literal(6);
        self.sharpness = self.b.read_literal(3);

        self.filter_deltas_enabled = self.b.read_flag();
        if self.filter_deltas_enabled && self.b.read_flag() {
            for delta in self.ref_filter_deltas.iter_mut() {
                if self.b.read_flag() {
                    *delta = self.b.read_magnitude_and_sign(6) as i8;
                }
            }
            for delta in self.mode_filter_deltas.iter_mut() {
                if self.b.read_flag() {
                    *delta = self.b.read_magnitude_and_sign(6) as i8;
                }
            }
        }
    }

    /// Reads the token-partition layout: a 2-bit log2 count, then the
    /// sizes of all partitions but the last, which takes the remainder.
    fn read_partitions(&mut self) -> Result<(), DecodingError> {
        let num_partitions = 1usize << self.b.read_literal(2);

        let mut rest = Vec::new();
        self.r.read_to_end(&mut rest)?;

        let size_table_len = 3 * (num_partitions - 1);
        if rest.len() < size_table_len {
            return Err(DecodingError::NotEnoughInitData);
        }
        let (size_table, mut data) = rest.split_at(size_table_len);

        self.partitions.clear();
        for i in 0..num_partitions {
            let size = if i + 1 < num_partitions {
                let entry = &size_table[3 * i..][..3];
                usize::from(entry[0]) | usize::from(entry[1]) << 8 | usize::from(entry[2]) << 16
            } else {
                data.len()
            };
            if size > data.len() {
                return Err(DecodingError::NotEnoughInitData);
            }
            let (partition, remaining) = data.split_at(size);
            data = remaining;

            let mut reader = BoolReader::new();
            reader.init(partition.to_vec());
            self.partitions.push(reader);
        }

        Ok(())
    }

    fn read_quantization_indices(&mut self) {
        let yac_index = i32::from(self.b.read_literal(7));
        let ydc_delta = self.b.read_optional_signed_value(4);
        let y2dc_delta = self.b.read_optional_signed_value(4);
        let y2ac_delta = self.b.read_optional_signed_value(4);
        let uvdc_delta = self.b.read_optional_signed_value(4);
        let uvac_delta = self.b.read_optional_signed_value(4);

        let dc_quant = |index: i32| DC_QUANT[index.clamp(0, 127) as usize];
        let ac_quant = |index: i32| AC_QUANT[index.clamp(0, 127) as usize];

        for i in 0..MAX_SEGMENTS {
            let base = if self.segments_enabled {
                if self.segment_feature_absolute {
                    i32::from(self.segments[i].quantizer_level)
                } else {
                    yac_index + i32::from(self.segments[i].quantizer_level)
                }
            } else {
                yac_index
            };

            let segment = &mut self.segments[i];
            segment.ydc = dc_quant(base + ydc_delta);
            segment.yac = ac_quant(base);
            segment.y2dc = dc_quant(base + y2dc_delta) * 2;
            segment.y2ac = ((i32::from(ac_quant(base + y2ac_delta)) * 155 / 100).max(8)) as i16;
            // The chroma DC index saturates at 117.
            segment.uvdc = dc_quant((base + uvdc_delta).min(117));
            segment.uvac = ac_quant(base + uvac_delta);
        }
    }

    fn read_token_prob_updates(&mut self) {
        for (i, block_type) in self.token_probs.iter_mut().enumerate() {
            for (j, band) in block_type.iter_mut().enumerate() {
                for (k, context) in band.iter_mut().enumerate() {
                    for (t, prob) in context.iter_mut().enumerate() {
                        if self.b.read_bool(COEFF_UPDATE_PROBS[i][j][k][t]) {
                            *prob = self.b.read_literal(8);
                        }
                    }
                }
            }
        }
    }

    fn read_macroblock_header(&mut self, mbx: usize) -> Result<MacroBlock, DecodingError> {
        let mut mb = MacroBlock::default();

        if self.segments_enabled && self.segments_update_map {
            mb.segment_id =
                self.b
                    .read_with_tree(&SEGMENT_ID_TREE, &self.segment_tree_probs, 0) as u8;
        }

        if let Some(prob) = self.prob_skip_false {
            mb.coeffs_skipped = self.b.read_bool(prob);
        }

        let luma = self
            .b
            .read_with_tree(&KEYFRAME_YMODE_TREE, &KEYFRAME_YMODE_PROBS, 0);
        mb.luma_mode =
            LumaMode::from_i8(luma).ok_or(DecodingError::LumaPredictionModeInvalid(luma))?;

        match mb.luma_mode.into_intra() {
            Some(implied) => mb.bpred = [implied; 16],
            None => {
                for i in 0..16 {
                    let above = if i < 4 {
                        self.top[mbx].bpred[12 + i]
                    } else {
                        mb.bpred[i - 4]
                    };
                    let left = if i % 4 == 0 {
                        self.left.bpred[i + 3]
                    } else {
                        mb.bpred[i - 1]
                    };

                    let probs = &KEYFRAME_BPRED_PROBS[above as usize][left as usize];
                    let intra = self.b.read_with_tree(&INTRA_MODE_TREE, probs, 0);
                    mb.bpred[i] = IntraMode::from_i8(intra)
                        .ok_or(DecodingError::IntraPredictionModeInvalid(intra))?;
                }
            }
        }

        let chroma = self
            .b
            .read_with_tree(&CHROMA_MODE_TREE, &KEYFRAME_CHROMA_MODE_PROBS, 0);
        mb.chroma_mode = ChromaMode::from_i8(chroma)
            .ok_or(DecodingError::ChromaPredictionModeInvalid(chroma))?;

        Ok(mb)
    }

    fn clear_context_for_skipped(&mut self, mb: &MacroBlock, mbx: usize) {
        self.left_ctx.y = [false; 4];
        self.left_ctx.u = [false; 2];
        self.left_ctx.v = [false; 2];
        self.top_ctx[mbx].y = [false; 4];
        self.top_ctx[mbx].u = [false; 2];
        self.top_ctx[mbx].v = [false; 2];
        if mb.luma_mode != LumaMode::B {
            // The Y2 context only resets where a Y2 block exists.
            self.left_ctx.y2 = false;
            self.top_ctx[mbx].y2 = false;
        }
    }

    /// Decodes the 24 dequantized residual blocks of one macroblock (16 Y,
    /// 4 U, 4 V), plus the Y2 block when the luma mode carries one.
    fn read_residual_data(&mut self, mb: &mut MacroBlock, mbx: usize, mby: usize) -> [i16; 384] {
        let mut blocks = [0i16; 384];
        let partition = mby % self.partitions.len();
        let segment = self.segments[usize::from(mb.segment_id)];
        let has_y2 = mb.luma_mode != LumaMode::B;
        let mut non_zero = false;

        let mut y2_dc = [0i16; 16];
        if has_y2 {
            let ctx = usize::from(self.top_ctx[mbx].y2) + usize::from(self.left_ctx.y2);
            let mut block = [0i16; 16];
            let last = Self::read_coefficients(
                &mut self.partitions[partition],
                &self.token_probs[1],
                &mut block,
                0,
                ctx,
                segment.y2dc,
                segment.y2ac,
            );
            let y2_nonzero = last > 0;
            self.top_ctx[mbx].y2 = y2_nonzero;
            self.left_ctx.y2 = y2_nonzero;
            non_zero |= y2_nonzero;

            transform::iwht4x4(&mut block);
            y2_dc = block;
        }

        let luma_type = if has_y2 { 0 } else { 3 };
        let first = usize::from(has_y2);
        let mut local_y = [[false; 4]; 4];
        for row in 0..4 {
            for col in 0..4 {
                let i = row * 4 + col;
                let above = if row == 0 {
                    self.top_ctx[mbx].y[col]
                } else {
                    local_y[row - 1][col]
                };
                let left = if col == 0 {
                    self.left_ctx.y[row]
                } else {
                    local_y[row][col - 1]
                };

                let block: &mut [i16; 16] =
                    (&mut blocks[16 * i..16 * i + 16]).try_into().unwrap();
                let last = Self::read_coefficients(
                    &mut self.partitions[partition],
                    &self.token_probs[luma_type],
                    block,
                    first,
                    usize::from(above) + usize::from(left),
                    segment.ydc,
                    segment.yac,
                );
                if has_y2 {
                    block[0] = y2_dc[i];
                }
                local_y[row][col] = last > 0;
                non_zero |= last > 0;
            }
        }
        for i in 0..4 {
            self.top_ctx[mbx].y[i] = local_y[3][i];
            self.left_ctx.y[i] = local_y[i][3];
        }

        for (plane, base) in [(0usize, 256usize), (1, 320)] {
            let mut local = [[false; 2]; 2];
            for row in 0..2 {
                for col in 0..2 {
                    let i = row * 2 + col;
                    let (top_flags, left_flags) = if plane == 0 {
                        (&self.top_ctx[mbx].u, &self.left_ctx.u)
                    } else {
                        (&self.top_ctx[mbx].v, &self.left_ctx.v)
                    };
                    let above = if row == 0 {
                        top_flags[col]
                    } else {
                        local[row - 1][col]
                    };
                    let left = if col == 0 {
                        left_flags[row]
                    } else {
                        local[row][col - 1]
                    };

                    let offset = base + 16 * i;
                    let block: &mut [i16; 16] =
                        (&mut blocks[offset..offset + 16]).try_into().unwrap();
                    let last = Self::read_coefficients(
                        &mut self.partitions[partition],
                        &self.token_probs[2],
                        block,
                        0,
                        usize::from(above) + usize::from(left),
                        segment.uvdc,
                        segment.uvac,
                    );
                    local[row][col] = last > 0;
                    non_zero |= last > 0;
                }
            }
            let (top_flags, left_flags) = if plane == 0 {
                (&mut self.top_ctx[mbx].u, &mut self.left_ctx.u)
            } else {
                (&mut self.top_ctx[mbx].v, &mut self.left_ctx.v)
            };
            for i in 0..2 {
                top_flags[i] = local[1][i];
                left_flags[i] = local[i][1];
            }
        }

        mb.non_zero_dct = non_zero;
        blocks
    }

    /// Token-tree decode of one 4x4 block, returning one past the last
    /// nonzero zig-zag position (0 when the block is empty).
    ///
    /// A truncated partition reads as an endless run of end-of-block
    /// tokens, so the remaining blocks decode to zero instead of aborting.
    fn read_coefficients(
        partition: &mut BoolReader,
        probs: &[[[Prob; 11]; 3]; 8],
        block: &mut [i16; 16],
        first: usize,
        context: usize,
        dc_quant: i16,
        ac_quant: i16,
    ) -> usize {
        let mut complexity = context;
        let mut skip_eob = false;
        let mut last_nonzero = 0;

        let mut i = first;
        while i < 16 {
            let band = usize::from(COEFF_BANDS[i]);
            let tree_probs = &probs[band][complexity];
            let start = if skip_eob { 2 } else { 0 };
            let token = partition.read_with_tree(&COEFF_TOKEN_TREE, tree_probs, start);

            let mut value = match token {
                DCT_EOB => break,
                DCT_0 => {
                    skip_eob = true;
                    complexity = 0;
                    i += 1;
                    continue;
                }
                literal @ 1..=4 => i32::from(literal),
                category => {
                    let (base, extra_probs) = DCT_CATEGORIES[category as usize - 5];
                    let mut extra = 0i32;
                    for &prob in extra_probs {
                        extra = (extra << 1) + i32::from(partition.read_bool(prob));
                    }
                    base + extra
                }
            };

            skip_eob = false;
            complexity = if value > 1 { 2 } else { 1 };

            if partition.read_flag() {
                value = -value;
            }

            let quant = i32::from(if i == 0 { dc_quant } else { ac_quant });
            block[ZIGZAG[i]] = clamp(value * quant, -2047, 2047) as i16;
            last_nonzero = i + 1;
            i += 1;
        }

        last_nonzero
    }

    fn reconstruct_macroblock(
        &mut self,
        mb: &MacroBlock,
        mbx: usize,
        mby: usize,
        blocks: &[i16; 384],
    ) {
        let stride = self.frame.ystride;
        let x0 = mbx * 16;
        let y0 = mby * 16;
        let has_above = mby > 0;
        let has_left = mbx > 0;

        match mb.luma_mode {
            LumaMode::B => {
                let above_right = self.luma_above_right(mbx, mby);
                for i in 0..16 {
                    let (row, col) = (i / 4, i % 4);
                    let xb = x0 + col * 4;
                    let yb = y0 + row * 4;
                    let edges = gather_4x4_edges(
                        &self.frame.ybuf,
                        stride,
                        xb,
                        yb,
                        if col == 3 { Some(above_right) } else { None },
                    );
                    let pred = predict_4x4(mb.bpred[i], &edges);
                    write_block(&mut self.frame.ybuf, stride, xb, yb, &pred);
                    apply_residual(&mut self.frame.ybuf, stride, xb, yb, block_at(blocks, i));
                }
            }
            whole => {
                predict_nxn(
                    &mut self.frame.ybuf,
                    stride,
                    x0,
                    y0,
                    16,
                    whole as usize,
                    has_above,
                    has_left,
                );
                for i in 0..16 {
                    let (row, col) = (i / 4, i % 4);
                    apply_residual(
                        &mut self.frame.ybuf,
                        stride,
                        x0 + col * 4,
                        y0 + row * 4,
                        block_at(blocks, i),
                    );
                }
            }
        }

        let uvstride = self.frame.uvstride;
        let cx0 = mbx * 8;
        let cy0 = mby * 8;
        for (plane, base) in [(0usize, 16usize), (1, 20)] {
            let buf = if plane == 0 {
                &mut self.frame.ubuf
            } else {
                &mut self.frame.vbuf
            };
            predict_nxn(
                buf,
                uvstride,
                cx0,
                cy0,
                8,
                mb.chroma_mode as usize,
                has_above,
                has_left,
            );
            for i in 0..4 {
                let (row, col) = (i / 2, i % 2);
                apply_residual(
                    buf,
                    uvstride,
                    cx0 + col * 4,
                    cy0 + row * 4,
                    block_at(blocks, base + i),
                );
            }
        }
    }

    /// The four pixels above and to the right of the macroblock, used by
    /// the right-column subblocks of every row.
    fn luma_above_right(&self, mbx: usize, mby: usize) -> [u8; 4] {
        let stride = self.frame.ystride;
        let x0 = mbx * 16;
        let y0 = mby * 16;
        if mby == 0 {
            [127; 4]
        } else if mbx + 1 == usize::from(self.mbwidth) {
            [self.frame.ybuf[(y0 - 1) * stride + x0 + 15]; 4]
        } else {
            let start = (y0 - 1) * stride + x0 + 16;
            self.frame.ybuf[start..start + 4].try_into().unwrap()
        }
    }

    fn filter_level_for(&self, mb: &MacroBlock) -> u8 {
        let mut level = if self.segments_enabled {
            let segment = &self.segments[usize::from(mb.segment_id)];
            if self.segment_feature_absolute {
                i32::from(segment.loopfilter_level)
            } else {
                i32::from(self.filter_level) + i32::from(segment.loopfilter_level)
            }
        } else {
            i32::from(self.filter_level)
        };

        if self.filter_deltas_enabled {
            // Keyframes are all intra, reference slot 0; B_PRED is the
            // only intra mode with a mode delta, slot 0.
            level += i32::from(self.ref_filter_deltas[0]);
            if mb.luma_mode == LumaMode::B {
                level += i32::from(self.mode_filter_deltas[0]);
            }
        }

        level.clamp(0, 63) as u8
    }

    fn filter_limits(&self, level: u8) -> (i32, i32) {
        let mut interior = i32::from(level);
        if self.sharpness > 0 {
            interior >>= if self.sharpness > 4 { 2 } else { 1 };
            let cap = 9 - i32::from(self.sharpness);
            interior = interior.min(cap);
        }
        let interior = interior.max(1);

        let hev_threshold = match level {
            40.. => 2,
            15.. => 1,
            _ => 0,
        };
        (interior, hev_threshold)
    }

    fn filter_frame(&mut self) {
        if self.filter_level == 0 && !self.segments_enabled {
            return;
        }

        for mby in 0..usize::from(self.mbheight) {
            for mbx in 0..usize::from(self.mbwidth) {
                let mb = self.macroblocks[mby * usize::from(self.mbwidth) + mbx];
                let level = self.filter_level_for(&mb);
                if level == 0 {
                    continue;
                }
                let (interior, hev) = self.filter_limits(level);
                let mb_edge_limit = (i32::from(level) + 2) * 2 + interior;
                let sub_edge_limit = i32::from(level) * 2 + interior;
                let filter_inner = mb.non_zero_dct || mb.luma_mode == LumaMode::B;

                if self.simple_filter {
                    self.filter_luma_simple(
                        mbx,
                        mby,
                        mb_edge_limit,
                        sub_edge_limit,
                        filter_inner,
                    );
                } else {
                    self.filter_macroblock_normal(
                        mbx,
                        mby,
                        hev,
                        interior,
                        mb_edge_limit,
                        sub_edge_limit,
                        filter_inner,
                    );
                }
            }
        }
    }

    fn filter_luma_simple(
        &mut self,
        mbx: usize,
        mby: usize,
        mb_edge_limit: i32,
        sub_edge_limit: i32,
        filter_inner: bool,
    ) {
        let stride = self.frame.ystride;
        let x0 = mbx * 16;
        let y0 = mby * 16;
        let buf = &mut self.frame.ybuf;

        if mbx > 0 {
            for y in 0..16 {
                loop_filter::simple_segment_vertical(buf, (y0 + y) * stride + x0, mb_edge_limit);
            }
        }
        if filter_inner {
            for x in (4..16).step_by(4) {
                for y in 0..16 {
                    loop_filter::simple_segment_vertical(
                        buf,
                        (y0 + y) * stride + x0 + x,
                        sub_edge_limit,
                    );
                }
            }
        }
        if mby > 0 {
            for x in 0..16 {
                loop_filter::simple_segment_horizontal(
                    buf,
                    y0 * stride + x0 + x,
                    stride,
                    mb_edge_limit,
                );
            }
        }
        if filter_inner {
            for y in (4..16).step_by(4) {
                for x in 0..16 {
                    loop_filter::simple_segment_horizontal(
                        buf,
                        (y0 + y) * stride + x0 + x,
                        stride,
                        sub_edge_limit,
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn filter_macroblock_normal(
        &mut self,
        mbx: usize,
        mby: usize,
        hev: i32,
        interior: i32,
        mb_edge_limit: i32,
        sub_edge_limit: i32,
        filter_inner: bool,
    ) {
        let ystride = self.frame.ystride;
        let uvstride = self.frame.uvstride;
        let x0 = mbx * 16;
        let y0 = mby * 16;
        let cx0 = mbx * 8;
        let cy0 = mby * 8;

        if mbx > 0 {
            for y in 0..16 {
                loop_filter::macroblock_filter_vertical(
                    &mut self.frame.ybuf,
                    (y0 + y) * ystride + x0,
                    hev,
                    interior,
                    mb_edge_limit,
                );
            }
            for plane in [&mut self.frame.ubuf, &mut self.frame.vbuf] {
                for y in 0..8 {
                    loop_filter::macroblock_filter_vertical(
                        plane,
                        (cy0 + y) * uvstride + cx0,
                        hev,
                        interior,
                        mb_edge_limit,
                    );
                }
            }
        }
        if filter_inner {
            for x in (4..16).step_by(4) {
                for y in 0..16 {
                    loop_filter::subblock_filter_vertical(
                        &mut self.frame.ybuf,
                        (y0 + y) * ystride + x0 + x,
                        hev,
                        interior,
                        sub_edge_limit,
                    );
                }
            }
            for plane in [&mut self.frame.ubuf, &mut self.frame.vbuf] {
                for y in 0..8 {
                    loop_filter::subblock_filter_vertical(
                        plane,
                        (cy0 + y) * uvstride + cx0 + 4,
                        hev,
                        interior,
                        sub_edge_limit,
                    );
                }
            }
        }
        if mby > 0 {
            for x in 0..16 {
                loop_filter::macroblock_filter_horizontal(
                    &mut self.frame.ybuf,
                    y0 * ystride + x0 + x,
                    ystride,
                    hev,
                    interior,
                    mb_edge_limit,
                );
            }
            for plane in [&mut self.frame.ubuf, &mut self.frame.vbuf] {
                for x in 0..8 {
                    loop_filter::macroblock_filter_horizontal(
                        plane,
                        cy0 * uvstride + cx0 + x,
                        uvstride,
                        hev,
                        interior,
                        mb_edge_limit,
                    );
                }
            }
        }
        if filter_inner {
            for y in (4..16).step_by(4) {
                for x in 0..16 {
                    loop_filter::subblock_filter_horizontal(
                        &mut self.frame.ybuf,
                        (y0 + y) * ystride + x0 + x,
                        ystride,
                        hev,
                        interior,
                        sub_edge_limit,
                    );
                }
            }
            for plane in [&mut self.frame.ubuf, &mut self.frame.vbuf] {
                for x in 0..8 {
                    loop_filter::subblock_filter_horizontal(
                        plane,
                        (cy0 + 4) * uvstride + cx0 + x,
                        uvstride,
                        hev,
                        interior,
                        sub_edge_limit,
                    );
                }
            }
        }
    }
}

fn block_at(blocks: &[i16; 384], index: usize) -> &[i16; 16] {
    (&blocks[16 * index..16 * index + 16]).try_into().unwrap()
}

/// Adds a residual block onto the prediction already in the plane. The
/// DC fast path covers blocks whose AC coefficients are all zero.
fn apply_residual(plane: &mut [u8], stride: usize, x0: usize, y0: usize, block: &[i16; 16]) {
    let mut residual = *block;
    if residual.iter().all(|&c| c == 0) {
        return;
    }
    if residual[1..].iter().all(|&c| c == 0) {
        transform::idct4x4_dc(&mut residual);
    } else {
        transform::idct4x4(&mut residual);
    }

    for row in 0..4 {
        for col in 0..4 {
            let index = (y0 + row) * stride + x0 + col;
            let value = i32::from(plane[index]) + i32::from(residual[row * 4 + col]);
            plane[index] = clamp(value, 0, 255) as u8;
        }
    }
}

fn write_block(plane: &mut [u8], stride: usize, x0: usize, y0: usize, pred: &[u8; 16]) {
    for row in 0..4 {
        plane[(y0 + row) * stride + x0..][..4].copy_from_slice(&pred[row * 4..row * 4 + 4]);
    }
}

/// Whole-block prediction for 16x16 luma and 8x8 chroma. `mode` follows
/// the shared DC/V/H/TM numbering of both mode enums.
fn predict_nxn(
    plane: &mut [u8],
    stride: usize,
    x0: usize,
    y0: usize,
    n: usize,
    mode: usize,
    has_above: bool,
    has_left: bool,
) {
    let above = |plane: &[u8], i: usize| -> u8 {
        if y0 == 0 {
            127
        } else {
            plane[(y0 - 1) * stride + x0 + i]
        }
    };
    let left = |plane: &[u8], i: usize| -> u8 {
        if x0 == 0 {
            129
        } else {
            plane[(y0 + i) * stride + x0 - 1]
        }
    };
    let corner = |plane: &[u8]| -> u8 {
        if y0 == 0 {
            127
        } else if x0 == 0 {
            129
        } else {
            plane[(y0 - 1) * stride + x0 - 1]
        }
    };

    match mode {
        // DC averages only real neighbors; 128 when there are none.
        0 => {
            let mut sum = 0u32;
            let mut count = 0u32;
            if has_above {
                for i in 0..n {
                    sum += u32::from(above(plane, i));
                }
                count += n as u32;
            }
            if has_left {
                for i in 0..n {
                    sum += u32::from(left(plane, i));
                }
                count += n as u32;
            }
            let dc = if count == 0 {
                128
            } else {
                ((sum + count / 2) / count) as u8
            };
            for row in 0..n {
                for col in 0..n {
                    plane[(y0 + row) * stride + x0 + col] = dc;
                }
            }
        }
        // V
        1 => {
            for col in 0..n {
                let value = above(plane, col);
                for row in 0..n {
                    plane[(y0 + row) * stride + x0 + col] = value;
                }
            }
        }
        // H
        2 => {
            for row in 0..n {
                let value = left(plane, row);
                for col in 0..n {
                    plane[(y0 + row) * stride + x0 + col] = value;
                }
            }
        }
        // TM
        _ => {
            let p = i32::from(corner(plane));
            for row in 0..n {
                let l = i32::from(left(plane, row));
                for col in 0..n {
                    let a = i32::from(above(plane, col));
                    plane[(y0 + row) * stride + x0 + col] = clamp(l + a - p, 0, 255) as u8;
                }
            }
        }
    }
}

/// Reference pixels around a 4x4 subblock: above, above-right, left, and
/// the corner, with the VP8 border conventions applied.
struct Edges {
    above: [u8; 8],
    left: [u8; 4],
    corner: u8,
}

fn gather_4x4_edges(
    plane: &[u8],
    stride: usize,
    x0: usize,
    y0: usize,
    above_right_override: Option<[u8; 4]>,
) -> Edges {
    let mut above = [127u8; 8];
    if y0 > 0 {
        above[..4].copy_from_slice(&plane[(y0 - 1) * stride + x0..][..4]);
        match above_right_override {
            Some(values) => above[4..].copy_from_slice(&values),
            None => above[4..].copy_from_slice(&plane[(y0 - 1) * stride + x0 + 4..][..4]),
        }
    }

    let mut left = [129u8; 4];
    if x0 > 0 {
        for (i, value) in left.iter_mut().enumerate() {
            *value = plane[(y0 + i) * stride + x0 - 1];
        }
    }

    let corner = if y0 == 0 {
        127
    } else if x0 == 0 {
        129
    } else {
        plane[(y0 - 1) * stride + x0 - 1]
    };

    Edges { above, left, corner }
}

fn avg2(a: u8, b: u8) -> u8 {
    ((u16::from(a) + u16::from(b) + 1) >> 1) as u8
}

fn avg3(a: u8, b: u8, c: u8) -> u8 {
    ((u16::from(a) + 2 * u16::from(b) + u16::from(c) + 2) >> 2) as u8
}

fn predict_4x4(mode: IntraMode, edges: &Edges) -> [u8; 16] {
    let a = &edges.above;
    let l = &edges.left;
    let p = edges.corner;
    let mut out = [0u8; 16];
    let mut set = |r: usize, c: usize, v: u8| out[r * 4 + c] = v;

    match mode {
        IntraMode::DC => {
            let sum: u16 = a[..4].iter().chain(l.iter()).map(|&v| u16::from(v)).sum();
            let dc = ((sum + 4) >> 3) as u8;
            for r in 0..4 {
                for c in 0..4 {
                    set(r, c, dc);
                }
            }
        }
        IntraMode::TM => {
            for r in 0..4 {
                for c in 0..4 {
                    let v = i32::from(l[r]) + i32::from(a[c]) - i32::from(p);
                    set(r, c, clamp(v, 0, 255) as u8);
                }
            }
        }
        IntraMode::VE => {
            let row = [
                avg3(p, a[0], a[1]),
                avg3(a[0], a[1], a[2]),
                avg3(a[1], a[2], a[3]),
                avg3(a[2], a[3], a[4]),
            ];
            for r in 0..4 {
                for c in 0..4 {
                    set(r, c, row[c]);
                }
            }
        }
        IntraMode::HE => {
            let col = [
                avg3(p, l[0], l[1]),
                avg3(l[0], l[1], l[2]),
                avg3(l[1], l[2], l[3]),
                avg3(l[2], l[3], l[3]),
            ];
            for r in 0..4 {
                for c in 0..4 {
                    set(r, c, col[r]);
                }
            }
        }
        IntraMode::LD => {
            for r in 0..4 {
                for c in 0..4 {
                    let d = r + c;
                    let v = if d == 6 {
                        avg3(a[6], a[7], a[7])
                    } else {
                        avg3(a[d], a[d + 1], a[d + 2])
                    };
                    set(r, c, v);
                }
            }
        }
        IntraMode::RD => {
            // Edge array from bottom-left around the corner to above-right.
            let e = [l[3], l[2], l[1], l[0], p, a[0], a[1], a[2], a[3]];
            for r in 0..4 {
                for c in 0..4 {
                    let d = 3 + c - r;
                    set(r, c, avg3(e[d - 1], e[d], e[d + 1]));
                }
            }
        }
        IntraMode::VR => {
            set(3, 0, avg3(l[2], l[1], l[0]));
            set(2, 0, avg3(l[1], l[0], p));
            let v = avg3(l[0], p, a[0]);
            set(3, 1, v);
            set(1, 0, v);
            let v = avg2(p, a[0]);
            set(2, 1, v);
            set(0, 0, v);
            let v = avg3(p, a[0], a[1]);
            set(3, 2, v);
            set(1, 1, v);
            let v = avg2(a[0], a[1]);
            set(2, 2, v);
            set(0, 1, v);
            let v = avg3(a[0], a[1], a[2]);
            set(3, 3, v);
            set(1, 2, v);
            let v = avg2(a[1], a[2]);
            set(2, 3, v);
            set(0, 2, v);
            set(1, 3, avg3(a[1], a[2], a[3]));
            set(0, 3, avg2(a[2], a[3]));
        }
        IntraMode::VL => {
            set(0, 0, avg2(a[0], a[1]));
            set(1, 0, avg3(a[0], a[1], a[2]));
            let v = avg2(a[1], a[2]);
            set(2, 0, v);
            set(0, 1, v);
            let v = avg3(a[1], a[2], a[3]);
            set(1, 1, v);
            set(3, 0, v);
            let v = avg2(a[2], a[3]);
            set(2, 1, v);
            set(0, 2, v);
            let v = avg3(a[2], a[3], a[4]);
            set(3, 1, v);
            set(1, 2, v);
            let v = avg2(a[3], a[4]);
            set(2, 2, v);
            set(0, 3, v);
            let v = avg3(a[3], a[4], a[5]);
            set(3, 2, v);
            set(1, 3, v);
            set(2, 3, avg3(a[4], a[5], a[6]));
            set(3, 3, avg3(a[5], a[6], a[7]));
        }
        IntraMode::HD => {
            set(3, 0, avg2(l[3], l[2]));
            set(3, 1, avg3(l[3], l[2], l[1]));
            let v = avg2(l[2], l[1]);
            set(2, 0, v);
            set(3, 2, v);
            let v = avg3(l[2], l[1], l[0]);
            set(2, 1, v);
            set(3, 3, v);
            let v = avg2(l[1], l[0]);
            set(1, 0, v);
            set(2, 2, v);
            let v = avg3(l[1], l[0], p);
            set(1, 1, v);
            set(2, 3, v);
            let v = avg2(l[0], p);
            set(0, 0, v);
            set(1, 2, v);
            let v = avg3(l[0], p, a[0]);
            set(0, 1, v);
            set(1, 3, v);
            set(0, 2, avg3(p, a[0], a[1]));
            set(0, 3, avg3(a[0], a[1], a[2]));
        }
        IntraMode::HU => {
            set(0, 0, avg2(l[0], l[1]));
            set(0, 1, avg3(l[0], l[1], l[2]));
            let v = avg2(l[1], l[2]);
            set(0, 2, v);
            set(1, 0, v);
            let v = avg3(l[1], l[2], l[3]);
            set(0, 3, v);
            set(1, 1, v);
            let v = avg2(l[2], l[3]);
            set(1, 2, v);
            set(2, 0, v);
            let v = avg3(l[2], l[3], l[3]);
            set(1, 3, v);
            set(2, 1, v);
            for &(r, c) in &[(2, 2), (2, 3), (3, 0), (3, 1), (3, 2), (3, 3)] {
                set(r, c, l[3]);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // A minimal keyframe: tag with the given first-partition size, start
    // code, dimensions, then all-zero partitions. The zero bitstream
    // decodes every header flag as unset, picks B_PRED with all-DC
    // subblocks, and reads end-of-block for every coefficient.
    fn zero_keyframe(width: u16, height: u16) -> Vec<u8> {
        let first_partition = 10u32;
        let tag = (first_partition << 5) | 0x10;
        let mut data = vec![tag as u8, (tag >> 8) as u8, (tag >> 16) as u8];
        data.extend_from_slice(&[0x9d, 0x01, 0x2a]);
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend_from_slice(&[0; 10]); // first partition
        data.extend_from_slice(&[0; 4]); // token partition
        data
    }

    #[test]
    fn zero_stream_decodes_to_flat_gray() {
        let mut decoder = Vp8Decoder::new(Cursor::new(zero_keyframe(1, 1)));
        let frame = decoder.decode_frame().unwrap();
        assert_eq!((frame.width, frame.height), (1, 1));

        // Y = U = V = 128 converts to r = g = b = 130 in BT.601.
        let mut rgba = [0u8; 4];
        frame.fill_rgba(&mut rgba);
        assert_eq!(rgba, [130, 130, 130, 255]);
    }

    #[test]
    fn cropping_emits_only_declared_pixels() {
        let mut decoder = Vp8Decoder::new(Cursor::new(zero_keyframe(2, 2)));
        let frame = decoder.decode_frame().unwrap();

        let mut rgb = [0u8; 12];
        frame.fill_rgb(&mut rgb);
        assert_eq!(rgb, [130; 12]);
    }

    #[test]
    fn interframes_are_rejected() {
        let mut data = zero_keyframe(1, 1);
        data[0] |= 1;
        let mut decoder = Vp8Decoder::new(Cursor::new(data));
        assert!(matches!(
            decoder.decode_frame(),
            Err(DecodingError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn bad_start_code_is_rejected() {
        let mut data = zero_keyframe(1, 1);
        data[3] = 0x9c;
        let mut decoder = Vp8Decoder::new(Cursor::new(data));
        assert!(matches!(
            decoder.decode_frame(),
            Err(DecodingError::Vp8MagicInvalid(_))
        ));
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let mut decoder = Vp8Decoder::new(Cursor::new(zero_keyframe(0, 1)));
        assert!(matches!(
            decoder.decode_frame(),
            Err(DecodingError::InfoBitsInvalid { .. })
        ));
    }

    #[test]
    fn dc_prediction_without_neighbors_is_midlevel() {
        // 127/129 edge pseudo-pixels average to 128 for the top-left
        // subblock.
        let edges = gather_4x4_edges(&[0u8; 0], 0, 0, 0, Some([127; 4]));
        let pred = predict_4x4(IntraMode::DC, &edges);
        assert_eq!(pred, [128; 16]);
    }

    #[test]
    fn tm_prediction_clamps() {
        let edges = Edges {
            above: [255; 8],
            left: [255, 0, 128, 10],
            corner: 0,
        };
        let pred = predict_4x4(IntraMode::TM, &edges);
        assert_eq!(&pred[0..4], &[255; 4]);
        assert_eq!(&pred[4..8], &[255; 4]);
    }
}
