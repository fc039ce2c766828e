use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, to_bson, Binary, Bson, DateTime, Document};
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions,
    ReturnDocument,
};
use mongodb::{Client, Collection, Database, IndexModel};
use uuid::Uuid;

use super::SubscriptionStore;
use crate::models::{Customer, Order, OrderStatus, Transaction, TransactionStatus, TransitionUpdate};

const RECEIPT_COUNTER: &str = "transaction_receipt";

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    order_collection: Collection<Order>,
    customer_collection: Collection<Customer>,
    transaction_collection: Collection<Transaction>,
    counter_collection: Collection<Document>,
}

/// UUID value as the driver writes it: documents are serialized in
/// non-human-readable mode, so `Uuid` fields land as generic binary.
fn uuid_bson(id: &Uuid) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: id.as_bytes().to_vec(),
    })
}

fn id_filter(id: &Uuid) -> Result<Document> {
    Ok(doc! { "_id": uuid_bson(id) })
}

fn statuses(values: &[TransactionStatus]) -> Result<Vec<Bson>> {
    Ok(values.iter().map(to_bson).collect::<Result<Vec<_>, _>>()?)
}

impl MongoStore {
    pub async fn connect(url: &str, db_name: &str) -> Result<Self> {
        let mut client_options = ClientOptions::parse(url).await?;
        client_options.app_name = Some("subscription-service".to_string());

        let client = Client::with_options(client_options)?;
        Ok(Self::new(&client.database(db_name)))
    }

    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            order_collection: db.collection("orders"),
            customer_collection: db.collection("customers"),
            transaction_collection: db.collection("transactions"),
            counter_collection: db.collection("counters"),
        }
    }

    pub async fn init_indexes(&self) -> Result<()> {
        let gateway_order_index = IndexModel::builder()
            .keys(doc! { "gateway_order_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("gateway_order_id_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let receipt_index = IndexModel::builder()
            .keys(doc! { "receipt": 1 })
            .options(
                IndexOptions::builder()
                    .name("receipt_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        // Duplicate-checkout lookups
        let order_status_index = IndexModel::builder()
            .keys(doc! { "order_id": 1, "status": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("order_status_created_idx".to_string())
                    .build(),
            )
            .build();

        let user_tx_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_transaction_idx".to_string())
                    .build(),
            )
            .build();

        self.transaction_collection
            .create_indexes(
                [gateway_order_index, receipt_index, order_status_index, user_tx_index],
                None,
            )
            .await?;

        let user_order_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "status": 1, "start_date": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_order_idx".to_string())
                    .build(),
            )
            .build();

        self.order_collection
            .create_indexes([user_order_index], None)
            .await?;

        tracing::info!("Subscription service indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.order_collection.insert_one(order, None).await?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.order_collection.find_one(id_filter(&id)?, None).await?)
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.customer_collection
            .replace_one(id_filter(&customer.id)?, customer, options)
            .await?;
        Ok(())
    }

    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>> {
        Ok(self
            .customer_collection
            .find_one(id_filter(&id)?, None)
            .await?)
    }

    async fn claim_checkout_lease(
        &self,
        order_id: Uuid,
        now: DateTime,
        until: DateTime,
    ) -> Result<bool> {
        let mut filter = id_filter(&order_id)?;
        filter.insert("status", to_bson(&OrderStatus::Pending)?);
        filter.insert(
            "$or",
            vec![
                doc! { "checkout_lease_until": Bson::Null },
                doc! { "checkout_lease_until": { "$lte": now } },
            ],
        );
        let update = doc! { "$set": { "checkout_lease_until": until } };

        let result = self.order_collection.update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn release_checkout_lease(&self, order_id: Uuid) -> Result<()> {
        let update = doc! { "$set": { "checkout_lease_until": Bson::Null } };
        self.order_collection
            .update_one(id_filter(&order_id)?, update, None)
            .await?;
        Ok(())
    }

    async fn activate_order(
        &self,
        order_id: Uuid,
        start: DateTime,
        expiry: DateTime,
    ) -> Result<bool> {
        let mut filter = id_filter(&order_id)?;
        filter.insert("status", to_bson(&OrderStatus::Pending)?);
        let update = doc! {
            "$set": {
                "status": to_bson(&OrderStatus::Completed)?,
                "is_active": true,
                "start_date": start,
                "expiration_date": expiry,
                "checkout_lease_until": Bson::Null,
            }
        };

        let result = self.order_collection.update_one(filter, update, None).await?;
        Ok(result.modified_count == 1)
    }

    async fn completed_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let filter = doc! {
            "user_id": uuid_bson(&user_id),
            "status": to_bson(&OrderStatus::Completed)?,
        };
        let options = FindOptions::builder()
            .sort(doc! { "start_date": 1, "created_at": 1 })
            .build();

        let cursor = self.order_collection.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn deactivate_orders_except(&self, user_id: Uuid, keep: Option<Uuid>) -> Result<u64> {
        let mut filter = doc! {
            "user_id": uuid_bson(&user_id),
            "status": to_bson(&OrderStatus::Completed)?,
            "is_active": true,
        };
        if let Some(keep) = keep {
            filter.insert("_id", doc! { "$ne": uuid_bson(&keep) });
        }
        let update = doc! { "$set": { "is_active": false } };

        let result = self.order_collection.update_many(filter, update, None).await?;
        Ok(result.modified_count)
    }

    async fn set_order_inactive(&self, order_id: Uuid) -> Result<bool> {
        let mut filter = id_filter(&order_id)?;
        filter.insert("is_active", true);
        let update = doc! { "$set": { "is_active": false } };

        let result = self.order_collection.update_one(filter, update, None).await?;
        Ok(result.modified_count == 1)
    }

    async fn next_receipt_sequence(&self) -> Result<u64> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = self
            .counter_collection
            .find_one_and_update(
                doc! { "_id": RECEIPT_COUNTER },
                doc! { "$inc": { "value": 1_i64 } },
                options,
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("receipt counter missing after upsert"))?;

        let value = counter.get_i64("value")?;
        Ok(u64::try_from(value)?)
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.transaction_collection
            .insert_one(transaction, None)
            .await?;
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self
            .transaction_collection
            .find_one(id_filter(&id)?, None)
            .await?)
    }

    async fn find_transaction_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<Transaction>> {
        let filter = doc! { "gateway_order_id": gateway_order_id };
        Ok(self.transaction_collection.find_one(filter, None).await?)
    }

    async fn open_transactions_for_order(
        &self,
        order_id: Uuid,
        since: DateTime,
    ) -> Result<Vec<Transaction>> {
        let filter = doc! {
            "order_id": uuid_bson(&order_id),
            "status": { "$in": statuses(&TransactionStatus::OPEN)? },
            "created_at": { "$gte": since },
        };
        let cursor = self.transaction_collection.find(filter, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let filter = doc! { "user_id": uuid_bson(&user_id) };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();

        let cursor = self.transaction_collection.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn reconcilable_transactions(&self, cutoff: DateTime) -> Result<Vec<Transaction>> {
        let filter = doc! {
            "$or": [
                {
                    "status": { "$in": statuses(&TransactionStatus::OPEN)? },
                    "created_at": { "$lt": cutoff },
                },
                { "activation_pending": true },
                { "needs_reverification": true },
            ]
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .build();

        let cursor = self.transaction_collection.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn transition_transaction(
        &self,
        id: Uuid,
        from: &[TransactionStatus],
        to: TransactionStatus,
        update: &TransitionUpdate,
    ) -> Result<bool> {
        let mut filter = id_filter(&id)?;
        filter.insert("status", doc! { "$in": statuses(from)? });

        let mut set = doc! {
            "status": to_bson(&to)?,
            "updated_at": DateTime::now(),
            "needs_reverification": update.needs_reverification,
        };
        if let Some(payment_id) = &update.payment_id {
            set.insert("payment_id", payment_id.as_str());
        }
        if let Some(at) = update.payment_timestamp {
            set.insert("payment_timestamp", at);
        }
        if let Some(amount_paid) = &update.amount_paid {
            set.insert("amount_paid", to_bson(amount_paid)?);
        }
        if let Some(amount_due) = &update.amount_due {
            set.insert("amount_due", to_bson(amount_due)?);
        }
        if let Some(attempts) = update.attempts {
            set.insert("attempts", i64::from(attempts));
        }
        if let Some(pending) = update.activation_pending {
            set.insert("activation_pending", pending);
        }

        let result = self
            .transaction_collection
            .update_one(filter, doc! { "$set": set }, None)
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn clear_activation_pending(&self, id: Uuid) -> Result<()> {
        self.transaction_collection
            .update_one(
                id_filter(&id)?,
                doc! { "$set": { "activation_pending": false } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn clear_needs_reverification(&self, id: Uuid) -> Result<()> {
        self.transaction_collection
            .update_one(
                id_filter(&id)?,
                doc! { "$set": { "needs_reverification": false } },
                None,
            )
            .await?;
        Ok(())
    }
}
