/// Bases accepted as unambiguous template input for primer design.
pub const UNAMBIGUOUS_BASES: &[u8] = b"ACGT";
/// IUPAC nucleotide codes accepted in locus sequences.
pub const IUPAC_BASES: &[u8] = b"ACGTURYSWKMBDHVN";

#[inline(always)]
pub fn letter_complement(letter: u8) -> u8 {
    match letter {
        b'A' => b'T',
        b'T' => b'A',
        b'G' => b'C',
        b'C' => b'G',
        b'a' => b't',
        b't' => b'a',
        b'g' => b'c',
        b'c' => b'g',
        other => other,
    }
}

/// Reverse complement, keeping case. Letters other than A/C/G/T (N, IUPAC codes,
/// gaps) are carried over unchanged.
pub fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(letter_complement)
        .map(char::from)
        .collect()
}

pub fn count_bases(seq: &str, bases: &[u8]) -> usize {
    seq.bytes().filter(|b| bases.contains(b)).count()
}

/// Fraction of G/C in `seq`, 0.0 for an empty sequence.
pub fn gc_content(seq: &str) -> f64 {
    if seq.is_empty() {
        return 0.0;
    }
    count_bases(seq, b"GCgc") as f64 / seq.len() as f64
}

/// Fraction of unpaired positions ('.') in a dot-bracket string, 0.0 if empty.
pub fn unpaired_fraction(notation: &str) -> f64 {
    if notation.is_empty() {
        return 0.0;
    }
    count_bases(notation, b".") as f64 / notation.len() as f64
}

pub fn is_unambiguous_dna(seq: &str) -> bool {
    seq.bytes()
        .all(|b| UNAMBIGUOUS_BASES.contains(&b.to_ascii_uppercase()))
}

/// True if every letter is an IUPAC nucleotide code, in either case.
pub fn is_iupac_dna(seq: &str) -> bool {
    seq.bytes()
        .all(|b| IUPAC_BASES.contains(&b.to_ascii_uppercase()))
}
