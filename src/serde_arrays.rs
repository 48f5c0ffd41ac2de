//! Serde adapters keeping `ndarray` fields as plain JSON arrays.
//!
//! ndarray's own serde representation wraps data in a versioned object; the
//! persistent formats this crate promises (trained-model files, GV
//! statistics) are plain nested arrays, so struct fields opt in to these
//! helpers with `#[serde(with = "...")]`.

/// `Array1<f64>` as a flat JSON array.
pub mod array1 {
    use ndarray::Array1;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Array1<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.to_vec().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array1<f64>, D::Error> {
        let data = Vec::<f64>::deserialize(deserializer)?;
        Ok(Array1::from(data))
    }
}

/// `Array2<f64>` as row-major nested JSON arrays.
pub mod array2 {
    use ndarray::Array2;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Array2<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<Vec<f64>> = value.rows().into_iter().map(|r| r.to_vec()).collect();
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array2<f64>, D::Error> {
        let rows = Vec::<Vec<f64>>::deserialize(deserializer)?;
        let nrows = rows.len();
        let ncols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(D::Error::custom("ragged matrix rows"));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((nrows, ncols), flat).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use ndarray::{array, Array1, Array2};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::array1")]
        v: Array1<f64>,
        #[serde(with = "super::array2")]
        m: Array2<f64>,
    }

    #[test]
    fn plain_json_round_trip() {
        let w = Wrapper {
            v: array![1.0, 2.5],
            m: array![[1.0, 0.0], [0.0, 2.0]],
        };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("[1.0,2.5]"));
        assert!(json.contains("[[1.0,0.0],[0.0,2.0]]"));
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.v, w.v);
        assert_eq!(back.m, w.m);
    }
}
