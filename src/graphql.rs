use std::sync::Arc;

use async_graphql::{
    Context, EmptySubscription, ErrorExtensions, ID, InputObject, Object, Result, Schema,
    SimpleObject,
};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

pub type SlotbookSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema(engine: Arc<Engine>) -> SlotbookSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(engine)
        .finish()
}

impl ErrorExtensions for EngineError {
    fn extend(&self) -> async_graphql::Error {
        async_graphql::Error::new(self.to_string()).extend_with(|_, ext| ext.set("code", self.code()))
    }
}

fn gql(e: EngineError) -> async_graphql::Error {
    e.extend()
}

fn engine<'a>(ctx: &Context<'a>) -> Result<&'a Arc<Engine>> {
    ctx.data::<Arc<Engine>>()
}

fn parse_id(id: &ID) -> Result<Ulid> {
    Ulid::from_string(id.as_str()).map_err(|e| {
        async_graphql::Error::new(format!("invalid id {:?}: {e}", id.as_str()))
            .extend_with(|_, ext| ext.set("code", "INVALID_INPUT"))
    })
}

fn parse_ids(ids: &[ID]) -> Result<Vec<Ulid>> {
    ids.iter().map(parse_id).collect()
}

fn to_id(id: Ulid) -> ID {
    ID(id.to_string())
}

// ── Output types ─────────────────────────────────────────

pub struct ClientObject(Client);

#[Object(name = "Client")]
impl ClientObject {
    async fn id(&self) -> ID {
        to_id(self.0.id)
    }

    async fn name(&self) -> &str {
        &self.0.name
    }

    async fn phone(&self) -> &str {
        &self.0.phone
    }

    async fn email(&self) -> &str {
        &self.0.email
    }
}

pub struct ProductObject(Product);

#[Object(name = "Product")]
impl ProductObject {
    async fn id(&self) -> ID {
        to_id(self.0.id)
    }

    async fn name(&self) -> &str {
        &self.0.name
    }

    async fn description(&self) -> &str {
        &self.0.description
    }

    async fn price(&self) -> f64 {
        self.0.price
    }

    async fn is_active(&self) -> bool {
        self.0.is_active
    }
}

pub struct CalendarObject(Calendar);

#[Object(name = "Calendar")]
impl CalendarObject {
    async fn id(&self) -> ID {
        to_id(self.0.id)
    }

    async fn name(&self) -> &str {
        &self.0.name
    }

    async fn description(&self) -> &str {
        &self.0.description
    }

    async fn is_active(&self) -> bool {
        self.0.is_active
    }

    /// Products offered on this calendar.
    async fn products(&self, ctx: &Context<'_>) -> Result<Vec<ProductObject>> {
        let engine = engine(ctx)?;
        Ok(self
            .0
            .products
            .iter()
            .filter_map(|id| engine.get_product(*id).ok())
            .map(ProductObject)
            .collect())
    }

    /// Reservations on this calendar, ordered by start time.
    async fn reservations(&self, ctx: &Context<'_>) -> Result<Vec<ReservationObject>> {
        let reservations = engine(ctx)?
            .calendar_reservations(self.0.id)
            .await
            .map_err(gql)?;
        Ok(reservations.into_iter().map(ReservationObject).collect())
    }
}

pub struct ReservationObject(Reservation);

#[Object(name = "Reservation")]
impl ReservationObject {
    async fn id(&self) -> ID {
        to_id(self.0.id)
    }

    async fn start_time(&self) -> Timestamp {
        self.0.start_time()
    }

    async fn end_time(&self) -> Timestamp {
        self.0.end_time()
    }

    /// Sum of the item price snapshots.
    async fn total_price(&self) -> f64 {
        self.0.total_price()
    }

    async fn client(&self, ctx: &Context<'_>) -> Result<ClientObject> {
        engine(ctx)?
            .get_client(self.0.client_id)
            .map(ClientObject)
            .map_err(gql)
    }

    async fn calendar(&self, ctx: &Context<'_>) -> Result<CalendarObject> {
        engine(ctx)?
            .get_calendar(self.0.calendar_id)
            .await
            .map(CalendarObject)
            .map_err(gql)
    }

    async fn items(&self) -> Vec<ReservationItemObject> {
        self.0.items.iter().cloned().map(ReservationItemObject).collect()
    }
}

pub struct ReservationItemObject(ReservationItem);

#[Object(name = "ReservationItem")]
impl ReservationItemObject {
    async fn id(&self) -> ID {
        to_id(self.0.id)
    }

    /// Product price at the time the item was saved.
    async fn price(&self) -> f64 {
        self.0.price
    }

    async fn product(&self, ctx: &Context<'_>) -> Result<ProductObject> {
        engine(ctx)?
            .get_product(self.0.product_id)
            .map(ProductObject)
            .map_err(gql)
    }
}

// ── Input types ──────────────────────────────────────────

#[derive(InputObject)]
pub struct ClientInput {
    pub name: String,
    #[graphql(default)]
    pub phone: String,
    pub email: String,
}

impl From<ClientInput> for ClientDraft {
    fn from(input: ClientInput) -> Self {
        ClientDraft {
            name: input.name,
            phone: input.phone,
            email: input.email,
        }
    }
}

#[derive(InputObject)]
pub struct ProductInput {
    pub name: String,
    #[graphql(default)]
    pub description: String,
    pub price: f64,
    #[graphql(default = true)]
    pub is_active: bool,
}

impl From<ProductInput> for ProductDraft {
    fn from(input: ProductInput) -> Self {
        ProductDraft {
            name: input.name,
            description: input.description,
            price: input.price,
            is_active: input.is_active,
        }
    }
}

#[derive(InputObject)]
pub struct CalendarInput {
    pub name: String,
    #[graphql(default)]
    pub description: String,
    #[graphql(default)]
    pub product_ids: Vec<ID>,
    #[graphql(default = true)]
    pub is_active: bool,
}

impl CalendarInput {
    fn into_draft(self) -> Result<CalendarDraft> {
        Ok(CalendarDraft {
            products: parse_ids(&self.product_ids)?,
            name: self.name,
            description: self.description,
            is_active: self.is_active,
        })
    }
}

#[derive(InputObject)]
pub struct CreateReservationInput {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub client_id: ID,
    pub calendar_id: ID,
    /// One item is created per product id, priced at the current product price.
    #[graphql(default)]
    pub product_ids: Vec<ID>,
}

#[derive(InputObject)]
pub struct UpdateReservationInput {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub client_id: ID,
    pub calendar_id: ID,
}

impl UpdateReservationInput {
    fn into_draft(self) -> Result<ReservationDraft> {
        Ok(ReservationDraft {
            start_time: self.start_time,
            end_time: self.end_time,
            client_id: parse_id(&self.client_id)?,
            calendar_id: parse_id(&self.calendar_id)?,
        })
    }
}

// ── Payloads ─────────────────────────────────────────────
//
// A payload is only returned for a committed write, so `ok` is always true
// and the entity is always present. A rejected write resolves the mutation
// field to null and reports a top-level error carrying `extensions.code`.

#[derive(SimpleObject)]
pub struct ClientPayload {
    ok: bool,
    client: ClientObject,
}

#[derive(SimpleObject)]
pub struct ProductPayload {
    ok: bool,
    product: ProductObject,
}

#[derive(SimpleObject)]
pub struct CalendarPayload {
    ok: bool,
    calendar: CalendarObject,
}

#[derive(SimpleObject)]
pub struct ReservationPayload {
    ok: bool,
    reservation: ReservationObject,
}

#[derive(SimpleObject)]
pub struct ReservationItemPayload {
    ok: bool,
    reservation_item: ReservationItemObject,
}

#[derive(SimpleObject)]
pub struct DeletePayload {
    ok: bool,
    id: ID,
}

fn deleted(id: Ulid) -> DeletePayload {
    DeletePayload { ok: true, id: to_id(id) }
}

// ── Roots ────────────────────────────────────────────────

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn client(&self, ctx: &Context<'_>, id: ID) -> Result<ClientObject> {
        engine(ctx)?.get_client(parse_id(&id)?).map(ClientObject).map_err(gql)
    }

    /// All clients, ordered by name.
    async fn clients(&self, ctx: &Context<'_>) -> Result<Vec<ClientObject>> {
        Ok(engine(ctx)?.list_clients().into_iter().map(ClientObject).collect())
    }

    async fn product(&self, ctx: &Context<'_>, id: ID) -> Result<ProductObject> {
        engine(ctx)?.get_product(parse_id(&id)?).map(ProductObject).map_err(gql)
    }

    async fn products(&self, ctx: &Context<'_>) -> Result<Vec<ProductObject>> {
        Ok(engine(ctx)?.list_products().into_iter().map(ProductObject).collect())
    }

    async fn calendar(&self, ctx: &Context<'_>, id: ID) -> Result<CalendarObject> {
        engine(ctx)?
            .get_calendar(parse_id(&id)?)
            .await
            .map(CalendarObject)
            .map_err(gql)
    }

    async fn calendars(&self, ctx: &Context<'_>) -> Result<Vec<CalendarObject>> {
        let calendars = engine(ctx)?.list_calendars().await;
        Ok(calendars.into_iter().map(CalendarObject).collect())
    }

    async fn reservation(&self, ctx: &Context<'_>, id: ID) -> Result<ReservationObject> {
        engine(ctx)?
            .get_reservation(parse_id(&id)?)
            .await
            .map(ReservationObject)
            .map_err(gql)
    }

    /// All reservations, ordered by start time.
    async fn reservations(&self, ctx: &Context<'_>) -> Result<Vec<ReservationObject>> {
        let reservations = engine(ctx)?.list_reservations().await;
        Ok(reservations.into_iter().map(ReservationObject).collect())
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    async fn create_client(&self, ctx: &Context<'_>, input: ClientInput) -> Result<ClientPayload> {
        let client = engine(ctx)?
            .create_client(Ulid::new(), input.into())
            .await
            .map_err(gql)?;
        Ok(ClientPayload {
            ok: true,
            client: ClientObject(client),
        })
    }

    async fn update_client(
        &self,
        ctx: &Context<'_>,
        id: ID,
        input: ClientInput,
    ) -> Result<ClientPayload> {
        let client = engine(ctx)?
            .update_client(parse_id(&id)?, input.into())
            .await
            .map_err(gql)?;
        Ok(ClientPayload {
            ok: true,
            client: ClientObject(client),
        })
    }

    /// Fails while any reservation references the client.
    async fn delete_client(&self, ctx: &Context<'_>, id: ID) -> Result<DeletePayload> {
        let id = parse_id(&id)?;
        engine(ctx)?.delete_client(id).await.map_err(gql)?;
        Ok(deleted(id))
    }

    async fn create_product(&self, ctx: &Context<'_>, input: ProductInput) -> Result<ProductPayload> {
        let product = engine(ctx)?
            .create_product(Ulid::new(), input.into())
            .await
            .map_err(gql)?;
        Ok(ProductPayload {
            ok: true,
            product: ProductObject(product),
        })
    }

    async fn update_product(
        &self,
        ctx: &Context<'_>,
        id: ID,
        input: ProductInput,
    ) -> Result<ProductPayload> {
        let product = engine(ctx)?
            .update_product(parse_id(&id)?, input.into())
            .await
            .map_err(gql)?;
        Ok(ProductPayload {
            ok: true,
            product: ProductObject(product),
        })
    }

    /// Also removes every reservation item that uses the product.
    async fn delete_product(&self, ctx: &Context<'_>, id: ID) -> Result<DeletePayload> {
        let id = parse_id(&id)?;
        engine(ctx)?.delete_product(id).await.map_err(gql)?;
        Ok(deleted(id))
    }

    async fn create_calendar(&self, ctx: &Context<'_>, input: CalendarInput) -> Result<CalendarPayload> {
        let calendar = engine(ctx)?
            .create_calendar(Ulid::new(), input.into_draft()?)
            .await
            .map_err(gql)?;
        Ok(CalendarPayload {
            ok: true,
            calendar: CalendarObject(calendar),
        })
    }

    async fn update_calendar(
        &self,
        ctx: &Context<'_>,
        id: ID,
        input: CalendarInput,
    ) -> Result<CalendarPayload> {
        let calendar = engine(ctx)?
            .update_calendar(parse_id(&id)?, input.into_draft()?)
            .await
            .map_err(gql)?;
        Ok(CalendarPayload {
            ok: true,
            calendar: CalendarObject(calendar),
        })
    }

    async fn delete_calendar(&self, ctx: &Context<'_>, id: ID) -> Result<DeletePayload> {
        let id = parse_id(&id)?;
        engine(ctx)?.delete_calendar(id).await.map_err(gql)?;
        Ok(deleted(id))
    }

    async fn create_reservation(
        &self,
        ctx: &Context<'_>,
        input: CreateReservationInput,
    ) -> Result<ReservationPayload> {
        let draft = ReservationDraft {
            start_time: input.start_time,
            end_time: input.end_time,
            client_id: parse_id(&input.client_id)?,
            calendar_id: parse_id(&input.calendar_id)?,
        };
        let products = parse_ids(&input.product_ids)?;
        let reservation = engine(ctx)?
            .create_reservation(Ulid::new(), draft, products)
            .await
            .map_err(gql)?;
        Ok(ReservationPayload {
            ok: true,
            reservation: ReservationObject(reservation),
        })
    }

    async fn update_reservation(
        &self,
        ctx: &Context<'_>,
        id: ID,
        input: UpdateReservationInput,
    ) -> Result<ReservationPayload> {
        let reservation = engine(ctx)?
            .update_reservation(parse_id(&id)?, input.into_draft()?)
            .await
            .map_err(gql)?;
        Ok(ReservationPayload {
            ok: true,
            reservation: ReservationObject(reservation),
        })
    }

    async fn delete_reservation(&self, ctx: &Context<'_>, id: ID) -> Result<DeletePayload> {
        let id = parse_id(&id)?;
        engine(ctx)?.delete_reservation(id).await.map_err(gql)?;
        Ok(deleted(id))
    }

    async fn add_reservation_item(
        &self,
        ctx: &Context<'_>,
        reservation_id: ID,
        product_id: ID,
    ) -> Result<ReservationItemPayload> {
        let item = engine(ctx)?
            .add_item(Ulid::new(), parse_id(&reservation_id)?, parse_id(&product_id)?)
            .await
            .map_err(gql)?;
        Ok(ReservationItemPayload {
            ok: true,
            reservation_item: ReservationItemObject(item),
        })
    }

    /// Point an existing item at a product, re-taking the price.
    async fn update_reservation_item(
        &self,
        ctx: &Context<'_>,
        id: ID,
        product_id: ID,
    ) -> Result<ReservationItemPayload> {
        let item = engine(ctx)?
            .update_item(parse_id(&id)?, parse_id(&product_id)?)
            .await
            .map_err(gql)?;
        Ok(ReservationItemPayload {
            ok: true,
            reservation_item: ReservationItemObject(item),
        })
    }

    async fn remove_reservation_item(&self, ctx: &Context<'_>, id: ID) -> Result<DeletePayload> {
        let id = parse_id(&id)?;
        engine(ctx)?.remove_item(id).await.map_err(gql)?;
        Ok(deleted(id))
    }
}
