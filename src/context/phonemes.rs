//! Japanese phoneme classification and the pluggable phoneme inventory.
//!
//! Each phoneme maps to a 32-bit binary feature record: type bits, place
//! and manner of articulation, and vowel characteristics. The preset tables
//! cover the Japanese inventory used by UTAU voicebanks (five vowels plus
//! long forms, the consonant series, the geminate `Q`, the moraic nasal `N`
//! and silence); anything else classifies as an all-zero record so unknown
//! symbols degrade quietly instead of failing extraction.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::warn;

/// Binary articulatory feature record. Always 32 bits wide when flattened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhonemeFeatures {
    // Phoneme type (8)
    pub is_vowel: bool,
    pub is_consonant: bool,
    pub is_silence: bool,
    pub is_long_vowel: bool,
    pub is_nasal: bool,
    pub is_fricative: bool,
    pub is_plosive: bool,
    pub is_semivowel: bool,
    // Place of articulation (6)
    pub place_bilabial: bool,
    pub place_alveolar: bool,
    pub place_palatal: bool,
    pub place_velar: bool,
    pub place_glottal: bool,
    pub place_dental: bool,
    // Manner of articulation (8)
    pub manner_stop: bool,
    pub manner_fricative: bool,
    pub manner_nasal: bool,
    pub manner_liquid: bool,
    pub manner_glide: bool,
    pub voiced: bool,
    pub aspirated: bool,
    pub palatalized: bool,
    // Vowel characteristics (10)
    pub vowel_front: bool,
    pub vowel_central: bool,
    pub vowel_back: bool,
    pub vowel_high: bool,
    pub vowel_mid: bool,
    pub vowel_low: bool,
    pub vowel_rounded: bool,
    pub vowel_unrounded: bool,
    pub vowel_long: bool,
    pub vowel_nasalized: bool,
}

impl PhonemeFeatures {
    pub const FEATURE_SIZE: usize = 32;

    pub fn to_vector(self) -> [f64; Self::FEATURE_SIZE] {
        let bits = [
            self.is_vowel,
            self.is_consonant,
            self.is_silence,
            self.is_long_vowel,
            self.is_nasal,
            self.is_fricative,
            self.is_plosive,
            self.is_semivowel,
            self.place_bilabial,
            self.place_alveolar,
            self.place_palatal,
            self.place_velar,
            self.place_glottal,
            self.place_dental,
            self.manner_stop,
            self.manner_fricative,
            self.manner_nasal,
            self.manner_liquid,
            self.manner_glide,
            self.voiced,
            self.aspirated,
            self.palatalized,
            self.vowel_front,
            self.vowel_central,
            self.vowel_back,
            self.vowel_high,
            self.vowel_mid,
            self.vowel_low,
            self.vowel_rounded,
            self.vowel_unrounded,
            self.vowel_long,
            self.vowel_nasalized,
        ];
        let mut vector = [0.0; Self::FEATURE_SIZE];
        for (slot, bit) in vector.iter_mut().zip(bits) {
            *slot = if bit { 1.0 } else { 0.0 };
        }
        vector
    }

    /// Hamming distance between two records, normalized to [0, 1].
    pub fn distance(self, other: Self) -> f64 {
        let a = self.to_vector();
        let b = other.to_vector();
        let differing = a.iter().zip(&b).filter(|(x, y)| *x != *y).count();
        differing as f64 / Self::FEATURE_SIZE as f64
    }
}

fn vowel(front: bool, central: bool, back: bool, high: bool, mid: bool, low: bool, rounded: bool) -> PhonemeFeatures {
    PhonemeFeatures {
        is_vowel: true,
        voiced: true,
        vowel_front: front,
        vowel_central: central,
        vowel_back: back,
        vowel_high: high,
        vowel_mid: mid,
        vowel_low: low,
        vowel_rounded: rounded,
        vowel_unrounded: !rounded,
        ..Default::default()
    }
}

fn long(mut base: PhonemeFeatures) -> PhonemeFeatures {
    base.is_long_vowel = true;
    base.vowel_long = true;
    base
}

fn plosive(bilabial: bool, alveolar: bool, velar: bool, voiced: bool) -> PhonemeFeatures {
    PhonemeFeatures {
        is_consonant: true,
        is_plosive: true,
        manner_stop: true,
        place_bilabial: bilabial,
        place_alveolar: alveolar,
        place_velar: velar,
        voiced,
        ..Default::default()
    }
}

fn fricative(alveolar: bool, palatal: bool, glottal: bool, voiced: bool) -> PhonemeFeatures {
    PhonemeFeatures {
        is_consonant: true,
        is_fricative: true,
        manner_fricative: true,
        place_alveolar: alveolar,
        place_palatal: palatal,
        place_glottal: glottal,
        palatalized: palatal,
        voiced,
        ..Default::default()
    }
}

fn nasal(bilabial: bool, alveolar: bool, velar: bool) -> PhonemeFeatures {
    PhonemeFeatures {
        is_consonant: true,
        is_nasal: true,
        manner_nasal: true,
        place_bilabial: bilabial,
        place_alveolar: alveolar,
        place_velar: velar,
        voiced: true,
        ..Default::default()
    }
}

static PHONEME_TABLE: Lazy<HashMap<&'static str, PhonemeFeatures>> = Lazy::new(|| {
    let mut table = HashMap::new();

    // Vowels /a i u e o/ and their long forms.
    let a = vowel(false, true, false, false, false, true, false);
    let i = vowel(true, false, false, true, false, false, false);
    let u = vowel(false, false, true, true, false, false, true);
    let e = vowel(true, false, false, false, true, false, false);
    let o = vowel(false, false, true, false, true, false, true);
    for (name, features) in [("a", a), ("i", i), ("u", u), ("e", e), ("o", o)] {
        table.insert(name, features);
    }
    for (short, names) in [
        ("a", ["aa", "a:"]),
        ("i", ["ii", "i:"]),
        ("u", ["uu", "u:"]),
        ("e", ["ee", "e:"]),
        ("o", ["oo", "o:"]),
    ] {
        let features = long(table[short]);
        for name in names {
            table.insert(name, features);
        }
    }

    // Plosives.
    table.insert("p", plosive(true, false, false, false));
    table.insert("b", plosive(true, false, false, true));
    table.insert("t", plosive(false, true, false, false));
    table.insert("d", plosive(false, true, false, true));
    table.insert("k", plosive(false, false, true, false));
    table.insert("g", plosive(false, false, true, true));

    // Fricatives.
    table.insert("s", fricative(true, false, false, false));
    table.insert("z", fricative(true, false, false, true));
    table.insert("sh", fricative(false, true, false, false));
    table.insert("zh", fricative(false, true, false, true));
    table.insert("h", fricative(false, false, true, false));
    let mut f = fricative(false, false, false, false);
    f.place_bilabial = true;
    table.insert("f", f);

    // Affricates pattern as palatalized/alveolar plosives.
    let mut ts = plosive(false, true, false, false);
    ts.is_fricative = true;
    table.insert("ts", ts);
    let mut dz = plosive(false, true, false, true);
    dz.is_fricative = true;
    table.insert("dz", dz);
    let mut ch = plosive(false, false, false, false);
    ch.place_palatal = true;
    ch.palatalized = true;
    table.insert("ch", ch);
    let mut j = ch;
    j.voiced = true;
    table.insert("j", j);

    // Nasals.
    table.insert("m", nasal(true, false, false));
    table.insert("n", nasal(false, true, false));
    table.insert("ng", nasal(false, false, true));

    // Liquid and glides.
    let r = PhonemeFeatures {
        is_consonant: true,
        manner_liquid: true,
        place_alveolar: true,
        voiced: true,
        ..Default::default()
    };
    table.insert("r", r);
    let y = PhonemeFeatures {
        is_consonant: true,
        is_semivowel: true,
        manner_glide: true,
        place_palatal: true,
        voiced: true,
        ..Default::default()
    };
    table.insert("y", y);
    let w = PhonemeFeatures {
        is_consonant: true,
        is_semivowel: true,
        manner_glide: true,
        place_velar: true,
        voiced: true,
        ..Default::default()
    };
    table.insert("w", w);

    // Special phonemes: geminate, moraic nasal, silence markers.
    let q = PhonemeFeatures {
        is_consonant: true,
        is_plosive: true,
        manner_stop: true,
        ..Default::default()
    };
    table.insert("Q", q);
    let moraic_n = PhonemeFeatures {
        is_consonant: true,
        is_nasal: true,
        manner_nasal: true,
        voiced: true,
        vowel_nasalized: true,
        ..Default::default()
    };
    table.insert("N", moraic_n);
    let silence = PhonemeFeatures {
        is_silence: true,
        ..Default::default()
    };
    for name in ["sil", "pau", "<SIL>"] {
        table.insert(name, silence);
    }

    table
});

/// Classifier over the preset Japanese tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct JapanesePhonemeClassifier;

impl JapanesePhonemeClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classifies a phoneme. CV syllables like `ka` fall back to their
    /// onset consonant; unknown symbols return an empty record.
    pub fn classify(&self, phoneme: &str) -> PhonemeFeatures {
        if let Some(features) = PHONEME_TABLE.get(phoneme) {
            return *features;
        }
        // Syllable fallback: longest known consonant prefix ("sha" → "sh").
        for prefix_len in (1..=2usize.min(phoneme.len())).rev() {
            if !phoneme.is_char_boundary(prefix_len) {
                continue;
            }
            if let Some(features) = PHONEME_TABLE.get(&phoneme[..prefix_len]) {
                if features.is_consonant {
                    return *features;
                }
            }
        }
        warn!(phoneme, "unknown phoneme, classifying as empty record");
        PhonemeFeatures::default()
    }

    pub fn is_vowel(&self, phoneme: &str) -> bool {
        PHONEME_TABLE.get(phoneme).map(|f| f.is_vowel).unwrap_or(false)
    }

    pub fn is_consonant(&self, phoneme: &str) -> bool {
        PHONEME_TABLE
            .get(phoneme)
            .map(|f| f.is_consonant)
            .unwrap_or(false)
    }

    pub fn is_silence(&self, phoneme: &str) -> bool {
        PHONEME_TABLE.get(phoneme).map(|f| f.is_silence).unwrap_or(false)
    }

    pub fn is_known(&self, phoneme: &str) -> bool {
        PHONEME_TABLE.contains_key(phoneme)
    }

    /// Normalized articulatory distance between two phonemes.
    pub fn distance(&self, a: &str, b: &str) -> f64 {
        self.classify(a).distance(self.classify(b))
    }
}

/// Registration-order phoneme inventory. Silence and the unknown marker
/// occupy fixed ids so encodings stay stable across voicebanks.
#[derive(Debug, Clone)]
pub struct PhonemeInventory {
    phoneme_to_id: HashMap<String, usize>,
    id_to_phoneme: Vec<String>,
}

impl PhonemeInventory {
    pub const SILENCE_ID: usize = 0;
    pub const UNKNOWN_ID: usize = 1;

    pub fn new() -> Self {
        let mut inventory = Self {
            phoneme_to_id: HashMap::new(),
            id_to_phoneme: Vec::new(),
        };
        inventory.register("sil");
        inventory.register("<UNK>");
        inventory
    }

    /// Inventory pre-loaded with the Japanese phoneme and syllable set.
    pub fn japanese() -> Self {
        let mut inventory = Self::new();
        for vowel in ["a", "i", "u", "e", "o"] {
            inventory.register(vowel);
        }
        for consonant in ["k", "g", "s", "z", "t", "d", "n", "h", "b", "p", "m", "y", "r", "w"] {
            inventory.register(consonant);
        }
        for syllable in [
            "ka", "ki", "ku", "ke", "ko", "ga", "gi", "gu", "ge", "go", "sa", "shi", "su", "se",
            "so", "za", "ji", "zu", "ze", "zo", "ta", "chi", "tsu", "te", "to", "da", "di", "du",
            "de", "do", "na", "ni", "nu", "ne", "no", "ha", "hi", "fu", "he", "ho", "ba", "bi",
            "bu", "be", "bo", "pa", "pi", "pu", "pe", "po", "ma", "mi", "mu", "me", "mo", "ya",
            "yu", "yo", "ra", "ri", "ru", "re", "ro", "wa", "wi", "we", "wo", "N", "Q",
        ] {
            inventory.register(syllable);
        }
        inventory
    }

    /// Registers a phoneme, returning its id (existing id when known).
    pub fn register(&mut self, phoneme: &str) -> usize {
        if let Some(id) = self.phoneme_to_id.get(phoneme) {
            return *id;
        }
        let id = self.id_to_phoneme.len();
        self.phoneme_to_id.insert(phoneme.to_string(), id);
        self.id_to_phoneme.push(phoneme.to_string());
        id
    }

    pub fn id_of(&self, phoneme: &str) -> usize {
        self.phoneme_to_id
            .get(phoneme)
            .copied()
            .unwrap_or(Self::UNKNOWN_ID)
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.id_to_phoneme.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_phoneme.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_phoneme.is_empty()
    }

    pub fn phonemes(&self) -> impl Iterator<Item = &str> {
        self.id_to_phoneme.iter().map(String::as_str)
    }

    /// One-hot encoding of a phoneme over the inventory.
    pub fn encode_one_hot(&self, phoneme: &str) -> Vec<f64> {
        let mut encoding = vec![0.0; self.len()];
        encoding[self.id_of(phoneme)] = 1.0;
        encoding
    }
}

impl Default for PhonemeInventory {
    fn default() -> Self {
        Self::new()
    }
}
