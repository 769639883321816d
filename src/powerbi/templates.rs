use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::metadata_db::{ValueType, now_ts};
use crate::powerbi::optimizer::{DaxMeasure, PowerBiOptimizer, StarSchema};
use crate::repository::UnifiedRepository;

/// Visuals on the first report page sit on a three-column grid, at most six
/// per page; the overflow goes to a two-column "Dettagli" page.
const MAIN_PAGE_COLUMNS: usize = 3;
const MAIN_PAGE_CAPACITY: usize = 6;
const DETAIL_PAGE_COLUMNS: usize = 2;

/// One report visual, described as data rather than rendered markup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Visualization {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    pub description: String,
}

fn population_visualizations() -> Vec<Visualization> {
    vec![
        Visualization {
            kind: "line_chart".to_string(),
            title: "Popolazione nel Tempo".to_string(),
            x_axis: Some("dim_time[year]".to_string()),
            y_axis: Some("Total Population".to_string()),
            legend: Some("dim_territory[territory_name]".to_string()),
            description: "Trend demografico per territorio".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "bar_chart".to_string(),
            title: "Popolazione per Territorio".to_string(),
            x_axis: Some("dim_territory[territory_name]".to_string()),
            y_axis: Some("Total Population".to_string()),
            description: "Distribuzione popolazione corrente".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "map".to_string(),
            title: "Densità Demografica".to_string(),
            location: Some("dim_territory[territory_code]".to_string()),
            value: Some("Population Density".to_string()),
            description: "Mappa della densità popolazione".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "donut_chart".to_string(),
            title: "Popolazione per Fascia d'Età".to_string(),
            category: Some("dim_age_group[age_group]".to_string()),
            value: Some("Total Population".to_string()),
            description: "Distribuzione per età".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "gauge".to_string(),
            title: "Tasso di Crescita".to_string(),
            value: Some("Population Growth Rate".to_string()),
            min_value: Some(-0.05),
            max_value: Some(0.05),
            description: "Tasso crescita demografica annuale".to_string(),
            ..Default::default()
        },
    ]
}

fn economic_visualizations() -> Vec<Visualization> {
    vec![
        Visualization {
            kind: "line_chart".to_string(),
            title: "PIL nel Tempo".to_string(),
            x_axis: Some("dim_time[year]".to_string()),
            y_axis: Some("SUM(fact_table[obs_value])".to_string()),
            legend: Some("dim_territory[territory_name]".to_string()),
            description: "Evoluzione PIL per territorio".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "waterfall_chart".to_string(),
            title: "Crescita PIL".to_string(),
            category: Some("dim_time[year]".to_string()),
            value: Some("GDP Growth".to_string()),
            description: "Contributi alla crescita PIL".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "scatter_chart".to_string(),
            title: "PIL vs Popolazione".to_string(),
            x_axis: Some("GDP Per Capita".to_string()),
            y_axis: Some("Total Population".to_string()),
            legend: Some("dim_territory[territory_name]".to_string()),
            description: "Relazione PIL pro-capite e popolazione".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "treemap".to_string(),
            title: "PIL per Settore".to_string(),
            category: Some("dim_sector[sector_name]".to_string()),
            value: Some("SUM(fact_table[obs_value])".to_string()),
            description: "Composizione PIL settoriale".to_string(),
            ..Default::default()
        },
    ]
}

fn employment_visualizations() -> Vec<Visualization> {
    vec![
        Visualization {
            kind: "line_chart".to_string(),
            title: "Tasso di Occupazione".to_string(),
            x_axis: Some("dim_time[year]".to_string()),
            y_axis: Some("Employment Rate".to_string()),
            legend: Some("dim_territory[territory_name]".to_string()),
            description: "Trend occupazione per territorio".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "clustered_bar_chart".to_string(),
            title: "Occupazione per Età e Genere".to_string(),
            x_axis: Some("dim_age_group[age_group]".to_string()),
            y_axis: Some("Employment Rate".to_string()),
            legend: Some("dim_gender[gender]".to_string()),
            description: "Tasso occupazione demografico".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "funnel_chart".to_string(),
            title: "Percorso Occupazionale".to_string(),
            stages: Some(vec![
                "Popolazione Attiva".to_string(),
                "Occupati".to_string(),
                "Disoccupati".to_string(),
            ]),
            values: Some(vec![
                "Total Population".to_string(),
                "Employment Rate".to_string(),
                "Unemployment Rate".to_string(),
            ]),
            description: "Funnel del mercato del lavoro".to_string(),
            ..Default::default()
        },
    ]
}

fn generic_visualizations() -> Vec<Visualization> {
    vec![
        Visualization {
            kind: "table".to_string(),
            title: "Dati Dettagliati".to_string(),
            columns: Some(vec![
                "dim_time[year]".to_string(),
                "dim_territory[territory_name]".to_string(),
                "fact_table[obs_value]".to_string(),
            ]),
            description: "Tabella dati completa".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "card".to_string(),
            title: "Totale Osservazioni".to_string(),
            value: Some("Total Observations".to_string()),
            description: "Numero totale record".to_string(),
            ..Default::default()
        },
        Visualization {
            kind: "card".to_string(),
            title: "Qualità Media".to_string(),
            value: Some("Quality Score".to_string()),
            description: "Punteggio qualità dati".to_string(),
            ..Default::default()
        },
    ]
}

/// Curated visuals for a data category; anything unknown gets the generic set.
pub fn visualizations_for_category(category: &str) -> Vec<Visualization> {
    match category {
        "popolazione" => population_visualizations(),
        "economia" => economic_visualizations(),
        "lavoro" => employment_visualizations(),
        _ => generic_visualizations(),
    }
}

/// A complete template: schema, measures, and visuals for one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub template_id: String,
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub star_schema: StarSchema,
    pub dax_measures: Vec<DaxMeasure>,
    pub visualizations: Vec<Visualization>,
    pub created_at: String,
}

/// Builds PowerBI template descriptors and packages them as `.pbit` ZIPs.
pub struct TemplateGenerator {
    repo: Arc<UnifiedRepository>,
    optimizer: Arc<PowerBiOptimizer>,
    templates_dir: PathBuf,
}

impl TemplateGenerator {
    pub fn new(
        repo: Arc<UnifiedRepository>,
        optimizer: Arc<PowerBiOptimizer>,
        templates_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            repo,
            optimizer,
            templates_dir: templates_dir.as_ref().to_path_buf(),
        }
    }

    pub fn generate_template(
        &self,
        dataset_id: &str,
        custom_visualizations: Option<Vec<Visualization>>,
    ) -> anyhow::Result<TemplateDescriptor> {
        let Some(dataset) = self.repo.metadata.get_dataset(dataset_id)? else {
            anyhow::bail!("dataset {dataset_id} not found in metadata registry");
        };

        let star_schema = self.optimizer.generate_star_schema(dataset_id)?;
        let dax_measures = self.optimizer.get_standard_measures(dataset_id)?;
        let visualizations =
            custom_visualizations.unwrap_or_else(|| visualizations_for_category(&dataset.category));

        let descriptor = TemplateDescriptor {
            template_id: format!("template_{dataset_id}"),
            dataset_id: dataset_id.to_string(),
            name: format!("{} - PowerBI Template", dataset.name),
            category: dataset.category,
            star_schema,
            dax_measures,
            visualizations,
            created_at: now_ts(),
        };

        self.repo.metadata.set_config(
            &format!("dataset.{dataset_id}.powerbi_template"),
            &serde_json::to_value(&descriptor)?,
            ValueType::Json,
        )?;
        tracing::info!("template generated for dataset {dataset_id}");
        Ok(descriptor)
    }

    /// Write the `.pbit` archive for a descriptor and return its path.
    pub fn create_pbit_file(&self, descriptor: &TemplateDescriptor) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.templates_dir)?;
        let path = self
            .templates_dir
            .join(format!("{}.pbit", descriptor.template_id));

        let file = std::fs::File::create(&path)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let entries = [
            ("Report/Layout", build_report_layout(descriptor)),
            ("DataModel", build_data_model(descriptor)),
            ("Metadata", self.build_metadata(descriptor)),
            ("Connections", self.build_connections(descriptor)?),
        ];
        for (name, value) in entries {
            zip.start_file(name, options)?;
            zip.write_all(serde_json::to_string_pretty(&value)?.as_bytes())?;
        }

        if let Ok(sample) = self.repo.analytics.fetch_observations(&descriptor.dataset_id, Some(5))
        {
            if !sample.is_empty() {
                zip.start_file("Data/SampleData.json", options)?;
                zip.write_all(
                    serde_json::to_string_pretty(&serde_json::json!({
                        "dataset_id": descriptor.dataset_id,
                        "rows": sample.to_records(),
                    }))?
                    .as_bytes(),
                )?;
            }
        }

        zip.finish()?;
        tracing::info!("pbit archive written to {}", path.display());
        Ok(path)
    }

    fn build_metadata(&self, descriptor: &TemplateDescriptor) -> serde_json::Value {
        serde_json::json!({
            "version": "1.0",
            "created": descriptor.created_at,
            "locale": "it-IT",
            "datasetId": descriptor.dataset_id,
            "templateId": descriptor.template_id,
            "requirements": {
                "application": "PowerBI Desktop",
                "minimumVersion": "2.120",
            },
        })
    }

    fn build_connections(&self, descriptor: &TemplateDescriptor) -> anyhow::Result<serde_json::Value> {
        let sqlite_path = self
            .repo
            .metadata
            .get_config("database.sqlite.path")?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let duckdb_path = self
            .repo
            .metadata
            .get_config("database.duckdb.path")?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        Ok(serde_json::json!({
            "connections": [
                {
                    "name": "OsservatorioMetadata",
                    "connectionString": format!("Data Source={sqlite_path}"),
                    "type": "sqlite",
                },
                {
                    "name": "OsservatorioAnalytics",
                    "connectionString": format!("Data Source={duckdb_path}"),
                    "type": "duckdb",
                },
            ],
            "refreshPolicy": {
                "datasetId": descriptor.dataset_id,
                "mode": "incremental",
            },
        }))
    }
}

/// Pages with visual containers on a grid: three columns and at most six
/// visuals on the first page, the rest two-column on "Dettagli".
fn build_report_layout(descriptor: &TemplateDescriptor) -> serde_json::Value {
    let visuals = &descriptor.visualizations;
    let main: Vec<serde_json::Value> = visuals
        .iter()
        .take(MAIN_PAGE_CAPACITY)
        .enumerate()
        .map(|(i, v)| visual_container(v, i, MAIN_PAGE_COLUMNS, 400, 300))
        .collect();

    let mut pages = vec![serde_json::json!({
        "name": "Panoramica",
        "displayName": descriptor.name,
        "visualContainers": main,
    })];

    if visuals.len() > MAIN_PAGE_CAPACITY {
        let detail: Vec<serde_json::Value> = visuals
            .iter()
            .skip(MAIN_PAGE_CAPACITY)
            .enumerate()
            .map(|(i, v)| visual_container(v, i, DETAIL_PAGE_COLUMNS, 600, 300))
            .collect();
        pages.push(serde_json::json!({
            "name": "Dettagli",
            "displayName": "Dettagli",
            "visualContainers": detail,
        }));
    }

    serde_json::json!({
        "id": 0,
        "reportName": descriptor.name,
        "sections": pages,
    })
}

fn visual_container(
    visual: &Visualization,
    index: usize,
    columns: usize,
    width: u32,
    height: u32,
) -> serde_json::Value {
    let col = index % columns;
    let row = index / columns;
    serde_json::json!({
        "x": col as u32 * (width + 20),
        "y": row as u32 * (height + 20),
        "width": width,
        "height": height,
        "visual": visual,
    })
}

fn build_data_model(descriptor: &TemplateDescriptor) -> serde_json::Value {
    let mut tables = vec![serde_json::json!({
        "name": descriptor.star_schema.fact_table,
        "kind": "fact",
    })];
    for dim in &descriptor.star_schema.dimension_tables {
        tables.push(serde_json::json!({ "name": dim, "kind": "dimension" }));
    }

    serde_json::json!({
        "name": format!("{}_model", descriptor.dataset_id),
        "tables": tables,
        "relationships": descriptor.star_schema.relationships,
        "measures": descriptor.dax_measures,
        "cultures": [{ "name": "it-IT" }],
    })
}
