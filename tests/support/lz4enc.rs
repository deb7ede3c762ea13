//! Greedy LZ4 block encoder used to build fixture images.

const MINMATCH: usize = 4;
const LASTLITERALS: usize = 5;
const MFLIMIT: usize = 12;
const HASH_LOG: u32 = 14;
const MAX_DISTANCE: usize = 65_535;

fn hash(seq: u32) -> usize {
    (seq.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

fn push_length(out: &mut Vec<u8>, mut n: usize) {
    while n >= 255 {
        out.push(255);
        n -= 255;
    }
    out.push(n as u8);
}

fn emit(out: &mut Vec<u8>, literals: &[u8], matched: Option<(usize, usize)>) {
    let lit = literals.len();
    let ml = matched.map_or(0, |(_, len)| len - MINMATCH);
    let token = ((lit.min(15) as u8) << 4) | ml.min(15) as u8;
    out.push(token);
    if lit >= 15 {
        push_length(out, lit - 15);
    }
    out.extend_from_slice(literals);
    if let Some((offset, _)) = matched {
        out.extend_from_slice(&(offset as u16).to_le_bytes());
        if ml >= 15 {
            push_length(out, ml - 15);
        }
    }
}

pub fn compress(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 2 + 16);
    let mut table = vec![usize::MAX; 1 << HASH_LOG];
    let mut anchor = 0;
    let mut ip = 0;

    if src.len() > MFLIMIT {
        let limit = src.len() - MFLIMIT;
        while ip < limit {
            let h = hash(read_u32(src, ip));
            let cand = table[h];
            table[h] = ip;
            if cand != usize::MAX && ip - cand <= MAX_DISTANCE && read_u32(src, cand) == read_u32(src, ip) {
                let max = src.len() - LASTLITERALS - ip;
                let mut len = MINMATCH;
                while len < max && src[cand + len] == src[ip + len] {
                    len += 1;
                }
                emit(&mut out, &src[anchor..ip], Some((ip - cand, len)));
                ip += len;
                anchor = ip;
            } else {
                ip += 1;
            }
        }
    }
    emit(&mut out, &src[anchor..], None);
    out
}

#[test]
fn encoder_output_decodes() {
    let data: Vec<u8> = b"abcabcabcabc-the quick brown fox-".iter().cycle().take(10_000).copied().collect();
    let packed = compress(&data);
    assert!(packed.len() < data.len() / 4);
    let mut out = vec![0u8; data.len()];
    let n = zvle::codec::decompress_partial(&packed, &mut out, data.len()).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(out, data);
}
