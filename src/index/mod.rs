//! The full-text offer index, backed by Tantivy.
//!
//! Offers are indexed on their title and HTML body through a lowercasing,
//! accent-folding analyzer; the id is a raw stored term so documents can be
//! deleted and filtered by identifier.

pub mod queue;

use crate::error::Result;
use crate::offer::Offer;
use crate::types::DatedOffer;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::Query;
use tantivy::schema::{
    Field, IndexRecordOption, OwnedValue, Schema, TextFieldIndexing, TextOptions, INDEXED, STORED,
    STRING,
};
use tantivy::tokenizer::{AsciiFoldingFilter, LowerCaser, SimpleTokenizer, TextAnalyzer};
use tantivy::{Index as TantivyIndex, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

pub const ANALYZER_NAME: &str = "simple_fr";

const WRITER_BUFFER_SIZE: usize = 20_000_000;

#[derive(Clone, Copy)]
pub struct OfferFields {
    pub id: Field,
    pub title: Field,
    pub html: Field,
    pub date: Field,
    pub min_salary: Field,
    pub max_salary: Field,
}

/// A single on-disk text index over the offer store.
pub struct OfferIndex {
    inner: TantivyIndex,
    reader: IndexReader,
    analyzer: TextAnalyzer,
    fields: OfferFields,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    let text_indexing = TextFieldIndexing::default()
        .set_tokenizer(ANALYZER_NAME)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let text = TextOptions::default().set_indexing_options(text_indexing);
    builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("title", text.clone());
    builder.add_text_field("html", text);
    builder.add_text_field("date", STORED);
    builder.add_u64_field("min_salary", INDEXED);
    builder.add_u64_field("max_salary", INDEXED);
    builder.build()
}

fn build_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(AsciiFoldingFilter)
        .build()
}

impl OfferIndex {
    /// Open the index at `dir`, creating it (and the directory) when absent.
    pub fn open_or_create(dir: &Path) -> Result<OfferIndex> {
        std::fs::create_dir_all(dir)?;
        let inner = if dir.join("meta.json").is_file() {
            TantivyIndex::open_in_dir(dir)?
        } else {
            TantivyIndex::create_in_dir(dir, build_schema())?
        };
        let analyzer = build_analyzer();
        inner.tokenizers().register(ANALYZER_NAME, analyzer.clone());
        let reader = inner
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        let schema = inner.schema();
        let fields = OfferFields {
            id: schema.get_field("id")?,
            title: schema.get_field("title")?,
            html: schema.get_field("html")?,
            date: schema.get_field("date")?,
            min_salary: schema.get_field("min_salary")?,
            max_salary: schema.get_field("max_salary")?,
        };
        Ok(OfferIndex {
            inner,
            reader,
            analyzer,
            fields,
        })
    }

    pub fn fields(&self) -> OfferFields {
        self.fields
    }

    pub fn reader(&self) -> &IndexReader {
        &self.reader
    }

    pub fn writer(&self) -> Result<IndexWriter> {
        Ok(self.inner.writer(WRITER_BUFFER_SIZE)?)
    }

    /// Run `text` through the index analyzer, returning its terms.
    pub fn analyze(&self, text: &str) -> Vec<String> {
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }

    pub fn add_offer(&self, writer: &mut IndexWriter, offer: &Offer) -> Result<()> {
        let f = self.fields;
        let mut doc = TantivyDocument::new();
        doc.add_text(f.id, &offer.id);
        doc.add_text(f.title, &offer.title);
        doc.add_text(f.html, &offer.html);
        doc.add_text(f.date, offer.date.to_rfc3339());
        doc.add_u64(f.min_salary, offer.min_salary.max(0) as u64);
        doc.add_u64(f.max_salary, offer.max_salary.max(0) as u64);
        writer.add_document(doc)?;
        Ok(())
    }

    pub fn remove_offer(&self, writer: &mut IndexWriter, id: &str) {
        writer.delete_term(Term::from_field_text(self.fields.id, id));
    }

    fn stored_text(doc: &TantivyDocument, field: Field) -> Option<String> {
        doc.get_first(field).and_then(|v| {
            let owned: OwnedValue = v.clone();
            match owned {
                OwnedValue::Str(s) => Some(s),
                _ => None,
            }
        })
    }

    /// Every live document id, straight from the segment stores.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let searcher = self.reader.searcher();
        let mut ids = Vec::new();
        for segment in searcher.segment_readers() {
            let store = segment.get_store_reader(1)?;
            for doc_id in segment.doc_ids_alive() {
                let doc: TantivyDocument = store.get(doc_id)?;
                if let Some(id) = Self::stored_text(&doc, self.fields.id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Run a query and return every matching offer with its date.
    pub fn search_dated(&self, query: &dyn Query) -> Result<Vec<DatedOffer>> {
        let searcher = self.reader.searcher();
        let limit = (searcher.num_docs() as usize).max(1);
        let hits = searcher.search(query, &TopDocs::with_limit(limit))?;
        let mut offers = Vec::with_capacity(hits.len());
        for (_score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address)?;
            let id = Self::stored_text(&doc, self.fields.id).unwrap_or_default();
            let date = Self::stored_text(&doc, self.fields.date).unwrap_or_default();
            offers.push(DatedOffer { date, id });
        }
        Ok(offers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tantivy::query::TermQuery;
    use tempfile::TempDir;

    fn offer(id: &str, title: &str, html: &str) -> Offer {
        Offer {
            id: id.to_string(),
            title: title.to_string(),
            html: html.to_string(),
            account: String::new(),
            salary: String::new(),
            location: String::new(),
            date: Utc.with_ymd_and_hms(2016, 3, 1, 0, 0, 0).unwrap(),
            min_salary: 0,
            max_salary: 0,
            url: String::new(),
        }
    }

    #[test]
    fn add_list_remove() {
        let dir = TempDir::new().unwrap();
        let index = OfferIndex::open_or_create(dir.path()).unwrap();
        let mut writer = index.writer().unwrap();
        index.add_offer(&mut writer, &offer("a", "dev", "rust")).unwrap();
        index.add_offer(&mut writer, &offer("b", "ops", "linux")).unwrap();
        writer.commit().unwrap();
        index.reader().reload().unwrap();

        let mut ids = index.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        index.remove_offer(&mut writer, "a");
        writer.commit().unwrap();
        index.reader().reload().unwrap();
        assert_eq!(index.list_ids().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn accents_fold_at_index_time() {
        let dir = TempDir::new().unwrap();
        let index = OfferIndex::open_or_create(dir.path()).unwrap();
        let mut writer = index.writer().unwrap();
        index
            .add_offer(&mut writer, &offer("a", "Ingénieur systèmes", ""))
            .unwrap();
        writer.commit().unwrap();
        index.reader().reload().unwrap();

        let term = Term::from_field_text(index.fields().title, "ingenieur");
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let hits = index.search_dated(&query).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].date, "2016-03-01T00:00:00+00:00");
    }

    #[test]
    fn analyze_matches_indexing() {
        let dir = TempDir::new().unwrap();
        let index = OfferIndex::open_or_create(dir.path()).unwrap();
        assert_eq!(
            index.analyze("Développeur C++ confirmé"),
            vec!["developpeur", "c", "confirme"]
        );
    }
}
