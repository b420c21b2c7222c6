use crate::types::Place;
use log::{info, warn};
use serde::Deserialize;
use std::env;

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    properties: Properties,
    geometry: Option<Geometry>,
}

#[derive(Deserialize)]
struct Properties {
    name: Option<String>,
}

#[derive(Deserialize)]
struct Geometry {
    coordinates: Vec<f64>,
}

/// Reads the place dataset once at startup. It never changes while we run.
pub fn load() -> Vec<Place> {
    let path = env::var("PLACES_PATH").unwrap_or_else(|_| "/data/places.json".to_string());
    info!("Loading places from {}", path);
    let content = std::fs::read_to_string(&path).expect("Unable to read place dataset");
    parse(&content).expect("Unable to parse place dataset")
}

fn parse(content: &str) -> Result<Vec<Place>, failure::Error> {
    let collection: FeatureCollection = serde_json::from_str(content)?;
    let mut places = vec![];
    for feature in collection.features {
        let name = match feature.properties.name {
            Some(name) => {
                if name.trim().is_empty() {
                    warn!("Skipping feature with a blank name");
                    continue;
                }
                name
            }
            None => {
                warn!("Skipping feature without a name");
                continue;
            }
        };
        // GeoJSON point order is [lon, lat].
        let (lon, lat) = match feature.geometry {
            Some(geometry) if geometry.coordinates.len() >= 2 => {
                (geometry.coordinates[0], geometry.coordinates[1])
            }
            _ => {
                warn!("Skipping feature '{}' without point coordinates", name);
                continue;
            }
        };
        places.push(Place { name, lat, lon });
    }
    Ok(places)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_named_point_features() {
        let content = r#"{
            "features": [
                {
                    "properties": { "name": "Biblioteca Central" },
                    "geometry": { "coordinates": [-70.6109, -33.4985] }
                },
                {
                    "properties": { "name": "Casa Central" },
                    "geometry": { "coordinates": [-70.6402, -33.4418] }
                }
            ]
        }"#;
        let places = parse(content).unwrap();
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].name, "Biblioteca Central");
        assert!((places[0].lon - -70.6109).abs() < 1e-9);
        assert!((places[0].lat - -33.4985).abs() < 1e-9);
    }

    #[test]
    fn test_parse_skips_unusable_features() {
        let content = r#"{
            "features": [
                { "properties": {}, "geometry": { "coordinates": [1.0, 2.0] } },
                { "properties": { "name": "  " }, "geometry": { "coordinates": [1.0, 2.0] } },
                { "properties": { "name": "Sin Geometria" } },
                { "properties": { "name": "Coordenada Corta" }, "geometry": { "coordinates": [1.0] } },
                {
                    "properties": { "name": "Aulas" },
                    "geometry": { "coordinates": [-70.61, -33.5] }
                }
            ]
        }"#;
        let places = parse(content).unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].name, "Aulas");
    }

    #[test]
    fn test_parse_rejects_malformed_document() {
        assert!(parse("not json").is_err());
    }
}
